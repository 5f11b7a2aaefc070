// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! PyPI XML-RPC client for discovering the packages a user maintains.

use anyhow::{Context, Result};
use std::collections::BTreeSet;

/// Fetch the set of packages `username` has a role on.
///
/// The result is deduplicated and sorted.
pub async fn user_packages(registry_url: &str, username: &str) -> Result<BTreeSet<String>> {
    let body = format!(
        "<?xml version=\"1.0\"?>\
         <methodCall><methodName>user_packages</methodName>\
         <params><param><value><string>{}</string></value></param></params>\
         </methodCall>",
        escape(username)
    );

    let client = reqwest::Client::new();
    let response = client
        .post(registry_url)
        .header("User-Agent", "pypi-download-stats")
        .header("Content-Type", "text/xml")
        .body(body)
        .send()
        .await
        .with_context(|| format!("failed to fetch packages for user '{}'", username))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!(
            "PyPI XML-RPC request failed with status {} for user '{}': {}",
            status,
            username,
            body
        );
    }

    let text = response
        .text()
        .await
        .context("failed to read PyPI XML-RPC response")?;

    parse_user_packages(&text)
        .with_context(|| format!("failed to parse PyPI XML-RPC response for user '{}'", username))
}

/// Parse a `user_packages` response: an array of `[role, package]` pairs.
fn parse_user_packages(xml: &str) -> Result<BTreeSet<String>> {
    if xml.contains("<fault>") {
        let detail = string_values(xml).join(": ");
        anyhow::bail!("XML-RPC fault: {}", detail);
    }
    if !xml.contains("<methodResponse>") {
        anyhow::bail!("response is not an XML-RPC method response");
    }

    let values = string_values(xml);
    if values.len() % 2 != 0 {
        anyhow::bail!("expected [role, package] pairs, got {} strings", values.len());
    }

    Ok(values
        .chunks_exact(2)
        .map(|pair| pair[1].clone())
        .collect())
}

/// All string values in document order, unescaped.
///
/// Both `<value><string>text</string></value>` and the untyped
/// `<value>text</value>` form count. Values of other scalar types are skipped
/// and container values are descended into.
fn string_values(xml: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut rest = xml;

    while let Some(pos) = rest.find("<value") {
        rest = &rest[pos + "<value".len()..];
        if let Some(after) = rest.strip_prefix("/>") {
            values.push(String::new());
            rest = after;
            continue;
        }
        let Some(after) = rest.strip_prefix('>') else {
            continue;
        };
        rest = after;

        let body = rest.trim_start();
        if let Some(after) = body.strip_prefix("<string/>") {
            values.push(String::new());
            rest = after;
        } else if let Some(after) = body.strip_prefix("<string>") {
            let Some(end) = after.find("</string>") else {
                break;
            };
            values.push(unescape(&after[..end]));
            rest = &after[end + "</string>".len()..];
        } else if let Some(end) = rest.find("</value>") {
            if !rest[..end].contains('<') {
                values.push(unescape(&rest[..end]));
                rest = &rest[end + "</value>".len()..];
            }
        }
    }

    values
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest
            .find(';')
            .and_then(|end| decode_entity(&rest[1..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let digits = name.strip_prefix('#')?;
            let code = match digits.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"<?xml version='1.0'?>
<methodResponse>
<params>
<param>
<value><array><data>
<value><array><data>
<value><string>Owner</string></value>
<value><string>zeta-tools</string></value>
</data></array></value>
<value><array><data>
<value><string>Maintainer</string></value>
<value><string>alpha</string></value>
</data></array></value>
<value><array><data>
<value><string>Owner</string></value>
<value><string>alpha</string></value>
</data></array></value>
</data></array></value>
</param>
</params>
</methodResponse>
"#;

    #[test]
    fn test_parse_user_packages_dedup_and_sort() {
        let packages = parse_user_packages(RESPONSE).unwrap();
        assert_eq!(
            packages.into_iter().collect::<Vec<_>>(),
            vec!["alpha".to_string(), "zeta-tools".to_string()]
        );
    }

    #[test]
    fn test_parse_user_packages_empty() {
        let xml = "<?xml version='1.0'?><methodResponse><params><param>\
                   <value><array><data>\n</data></array></value>\
                   </param></params></methodResponse>";
        assert!(parse_user_packages(xml).unwrap().is_empty());
    }

    #[test]
    fn test_parse_fault() {
        let xml = "<?xml version='1.0'?><methodResponse><fault><value><struct>\
                   <member><name>faultCode</name><value><int>1</int></value></member>\
                   <member><name>faultString</name><value><string>boom</string></value></member>\
                   </struct></value></fault></methodResponse>";
        let err = parse_user_packages(xml).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_parse_rejects_non_xmlrpc() {
        assert!(parse_user_packages("<html>503</html>").is_err());
    }

    #[test]
    fn test_string_values_unescape_and_empty() {
        let xml = "<value><string>a&amp;b &lt;c&gt;</string></value>\
                   <value><string/></value><value/><value><string>d</string></value>";
        assert_eq!(string_values(xml), vec!["a&b <c>", "", "", "d"]);
    }

    #[test]
    fn test_string_values_untyped_and_numeric_entities() {
        let xml = "<value><array><data>\
                   <value>Owner</value>\
                   <value>it&#39;s-&#x41;&amp;lt;</value>\
                   <value><int>7</int></value>\
                   <value>\n</value>\
                   </data></array></value>";
        assert_eq!(string_values(xml), vec!["Owner", "it's-A&lt;", "\n"]);
    }

    #[test]
    fn test_unescape_leaves_unknown_entities() {
        assert_eq!(unescape("a & b &bogus; &#xZZ;"), "a & b &bogus; &#xZZ;");
    }

    #[test]
    fn test_parse_untyped_pairs() {
        let xml = "<?xml version='1.0'?><methodResponse><params><param>\
                   <value><array><data>\
                   <value><array><data><value>Owner</value><value>beta</value></data></array></value>\
                   <value><array><data><value><string>Maintainer</string></value>\
                   <value>alpha</value></data></array></value>\
                   </data></array></value>\
                   </param></params></methodResponse>";
        let packages = parse_user_packages(xml).unwrap();
        assert_eq!(
            packages.into_iter().collect::<Vec<_>>(),
            vec!["alpha".to_string(), "beta".to_string()]
        );
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b>&c"), "a&lt;b&gt;&amp;c");
    }
}
