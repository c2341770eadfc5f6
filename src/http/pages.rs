//! Built-in pages served by the proxy itself

use super::head::Headers;
use chrono::Utc;

/// Content type of the root certificate download
pub const CERT_CONTENT_TYPE: &str = "application/x-x509-ca-cert";

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Echo page listing the request headers and linking the root certificate
pub fn hello_page(server_name: &str, headers: &Headers, cert_url: &str) -> String {
    let name = escape(server_name);
    let mut rows = String::new();
    for (k, v) in headers.iter() {
        rows.push_str(&format!("<div><pre>{} : {}</pre></div>\n", escape(k), escape(v)));
    }
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>{name}</title>\n</head>\n<body>\n\
         <h2>{name} Echo Service</h2>\n<pre>{time}</pre>\n<h4>REQUEST HEADERS</h4>\n{rows}<hr/>\n\
         <ul>\n<li>\nYou can download the <a href=\"{cert}\">{name} Root certificate</a>\n</li>\n</ul>\n\
         </body>\n</html>\n",
        name = name,
        time = Utc::now().to_rfc3339(),
        rows = rows,
        cert = escape(cert_url),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_page_escapes_headers() {
        let mut headers = Headers::default();
        headers.append("User-Agent", "<script>alert(1)</script>");
        let page = hello_page("Sot", &headers, "http://sot.sot/do-not-trust.crt");
        assert!(page.contains("Sot Echo Service"));
        assert!(page.contains("&lt;script&gt;"));
        assert!(!page.contains("<script>"));
        assert!(page.contains("href=\"http://sot.sot/do-not-trust.crt\""));
    }
}
