//! Minimal server-rendered pages.
//!
//! The real frontend lives behind the TLS edge; these pages are just enough
//! to log in, land, and host the terminal widget.

use axum::response::Html;

/// Landing page.
pub fn index() -> Html<String> {
    Html(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>trmnl</title></head>
<body>
  <h1>trmnl</h1>
  <p>Your sessions: <a href="/my/sessions">/my/sessions</a></p>
  <form method="post" action="/session/new"><button>New terminal session</button></form>
</body>
</html>"#
            .to_string(),
    )
}

/// Login form. `error` is rendered above the form when present; `next` is
/// carried through the submission.
pub fn login(error: Option<&str>, next: &str) -> Html<String> {
    let error_html = error
        .map(|e| format!("<p class=\"error\">{}</p>", html_escape(e)))
        .unwrap_or_default();
    Html(format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>trmnl login</title></head>
<body>
  <h1>Sign in</h1>
  {error_html}
  <form method="post" action="/login">
    <input type="hidden" name="next" value="{next}">
    <label>Username <input name="username" autocomplete="username"></label>
    <label>Password <input name="password" type="password" autocomplete="current-password"></label>
    <button>Sign in</button>
  </form>
</body>
</html>"#,
        error_html = error_html,
        next = html_escape(next),
    ))
}

/// Terminal shell page: connects the browser to the session's WebSocket
/// bridge with the `tty` subprotocol.
pub fn terminal(session_id: &str) -> Html<String> {
    Html(format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>trmnl session</title></head>
<body>
  <pre id="screen"></pre>
  <script>
    const proto = location.protocol === "https:" ? "wss" : "ws";
    const ws = new WebSocket(proto + "://" + location.host + "/terminal/{id}/ws", ["tty"]);
    ws.binaryType = "arraybuffer";
    const screen = document.getElementById("screen");
    const decoder = new TextDecoder();
    ws.onopen = () => ws.send(JSON.stringify({{columns: 80, rows: 24}}));
    ws.onmessage = (ev) => {{
      const bytes = new Uint8Array(ev.data);
      if (bytes.length > 0 && bytes[0] === 0x30) {{
        screen.textContent += decoder.decode(bytes.subarray(1));
      }}
    }};
    document.addEventListener("keypress", (ev) => {{
      ws.send(new Blob(["0", ev.key]));
    }});
  </script>
</body>
</html>"#,
        id = html_escape(session_id),
    ))
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escaping() {
        assert_eq!(html_escape("<b>&\"x\""), "&lt;b&gt;&amp;&quot;x&quot;");
        let page = login(Some("<script>"), "/next");
        assert!(!page.0.contains("<script>alert"));
        assert!(page.0.contains("&lt;script&gt;"));
    }
}
