//! HTML content helpers for the overlord-web UI.
//!
//! Exports static pages (`INDEX_PAGE`, `LOGIN_PAGE`) and the
//! `setup_2fa` helper which renders a QR code and OTP secret. The full
//! dashboard UI (terminal multiplexing, agent tree, file browser) is out of
//! scope here (spec.md §1 "HTTP routing, static asset serving, dashboard web
//! UI ... out of scope"); this placeholder only proves the authenticated
//! route is reachable and lists connected agents via the JSON API.
//!
/// Minimal placeholder dashboard: lists agents from `/api/agents`.
pub const INDEX_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Overlord</title>
    <style>
        body { background: #121212; color: #e0e0e0; font-family: monospace; padding: 2rem; }
        h1 { color: #00ff41; }
        ul { list-style: none; padding: 0; }
        li { padding: 0.5rem 0; border-bottom: 1px solid #333; }
    </style>
</head>
<body>
    <h1>Overlord</h1>
    <p>Connected agents (see <code>/api/agents</code>, <code>/api/monitor</code> for the live feed):</p>
    <ul id="agents"></ul>
    <script>
        async function refresh() {
            const res = await fetch('/api/agents');
            const agents = await res.json();
            document.getElementById('agents').innerHTML =
                agents.map(a => `<li>${a.mid} (${a.sid})</li>`).join('');
        }
        refresh();
        setInterval(refresh, 5000);
    </script>
</body>
</html>"#;

/// HTML page for authentication with password and OTP input
pub const LOGIN_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Hub Login</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
        body { background: #121212; color: #e0e0e0; font-family: 'Segoe UI', sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; }
        .login-card { background: #1e1e1e; padding: 2rem; border-radius: 12px; box-shadow: 0 10px 30px rgba(0,0,0,0.5); width: 100%; max-width: 350px; }
        h2 { text-align: center; color: #00ff41; margin-bottom: 1.5rem; font-family: monospace; }
        input { width: 100%; padding: 12px; margin: 10px 0; border-radius: 6px; border: 1px solid #333; background: #252525; color: white; box-sizing: border-box; }
        button { width: 100%; padding: 12px; background: #007bff; border: none; color: white; border-radius: 6px; cursor: pointer; font-weight: bold; margin-top: 10px; }
        button:hover { background: #0056b3; }
        .error { color: #ff4444; font-size: 0.8rem; text-align: center; display: none; }
    </style>
</head>
<body>
    <div class="login-card">
        <h2>HUB_AUTH</h2>
        <form action="/login" method="POST">
            <input type="password" name="password" placeholder="Password" required>
            <input type="text" name="otp_code" placeholder="000000 (OTP)" inputmode="numeric" pattern="[0-9]{6}" required>
            <button type="submit">Sigin</button>
        </form>
        <div id="msg" class="error">Bad credentials</div>
    </div>
    <script>
        if(window.location.search.includes('error')) document.getElementById('msg').style.display='block';
    </script>
</body>
</html>"#;

/// Generate 2FA setup page with QR code and secret key
///
/// # Arguments
/// * `qr_png_b64` - Base64 encoded QR code PNG image
/// * `otp_secret` - Raw OTP secret for manual entry
pub async fn setup_2fa(qr_png_b64: &str, otp_secret: &str) -> String {
    format!(
        "<html><body style='background:#1a1a1a;color:white;text-align:center;padding:50px;'>
            <h2>2FA Configuration</h2>
            <p>Scan Code with Google Authenticator, Microsoft Authenticator, Authy ...:</p>
            <img src='data:image/png;base64,{}' style='border:10px solid white; border-radius:10px;' />
            <p style='margin-top:20px;'>Manual Key: <code>{}</code></p>
            <br><a href='/login' style='color:#007bff;'>Go to Login</a>
        </body></html>",
        qr_png_b64, otp_secret
    )
}
