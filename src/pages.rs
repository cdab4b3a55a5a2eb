//! HTML pages served by the dispatcher itself

use crate::route::Route;
use std::fmt::Write;

/// Escape text for safe interpolation into HTML content and attribute values
pub fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Name to pass to `hostgate run` for a hostname
fn app_name(hostname: &str) -> &str {
    hostname.strip_suffix(".localhost").unwrap_or(hostname)
}

/// Render the page shown when no route matches `hostname`
pub fn not_found_page(hostname: &str, routes: &[Route]) -> String {
    let safe_host = escape_html(hostname);

    let active = if routes.is_empty() {
        "<p><em>No apps running.</em></p>".to_string()
    } else {
        let mut items = String::new();
        for route in routes {
            let name = escape_html(&route.hostname);
            let _ = write!(
                items,
                r#"<li><a href="http://{name}">{name}</a> - localhost:{port}</li>"#,
                port = escape_html(&route.port.to_string()),
            );
        }
        format!("<h2>Active apps:</h2>\n    <ul>{items}</ul>")
    };

    format!(
        r#"<!DOCTYPE html>
<html>
  <head><title>hostgate - Not Found</title></head>
  <body style="font-family: system-ui; padding: 40px; max-width: 600px; margin: 0 auto;">
    <h1>Not Found</h1>
    <p>No app registered for <strong>{safe_host}</strong></p>
    {active}
    <p>Start an app with: <code>hostgate run {name} your-command</code></p>
  </body>
</html>
"#,
        name = escape_html(app_name(hostname)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<script>alert("x" & 'y')</script>"#),
            "&lt;script&gt;alert(&quot;x&quot; &amp; &#39;y&#39;)&lt;/script&gt;"
        );
        assert_eq!(escape_html("app.localhost"), "app.localhost");
    }

    #[test]
    fn test_not_found_lists_routes() {
        let routes = vec![Route::new("b.localhost", 4002, 1)];
        let page = not_found_page("a.localhost", &routes);

        assert!(page.contains("No app registered for <strong>a.localhost</strong>"));
        assert!(page.contains(r#"<a href="http://b.localhost">b.localhost</a> - localhost:4002"#));
        assert!(!page.contains(r#"href="http://a.localhost""#));
        assert!(!page.contains("No apps running"));
        assert!(page.contains("hostgate run a your-command"));
    }

    #[test]
    fn test_not_found_without_routes() {
        let page = not_found_page("myapp.localhost", &[]);

        assert!(page.contains("<em>No apps running.</em>"));
        assert!(!page.contains("Active apps"));
        assert!(page.contains("hostgate run myapp your-command"));
    }

    #[test]
    fn test_not_found_escapes_everything() {
        let routes = vec![Route::new("<script>alert(1)</script>.localhost", 4002, 1)];
        let page = not_found_page("<img src=x onerror=alert(1)>", &routes);

        assert!(!page.contains("<script>"));
        assert!(!page.contains("<img"));
        assert!(page.contains("&lt;script&gt;alert(1)&lt;/script&gt;.localhost"));
        assert!(page.contains("&lt;img src=x onerror=alert(1)&gt;"));
    }

    #[test]
    fn test_app_name_strips_localhost_suffix() {
        assert_eq!(app_name("api.localhost"), "api");
        assert_eq!(app_name("api.example.com"), "api.example.com");
    }
}
