//! Session management: `jobtrail auth`.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::path::Path;

use jobtrail::config::Config;
use jobtrail::session::{Cookie, SessionManager, SessionState};

use super::super::AuthCommands;
use super::{EXIT_OK, print_json};

/// Accept either a full session state or a bare cookie array, as exported
/// by most browser cookie tools.
fn parse_session_file(host: &str, path: &Path) -> Result<SessionState> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read session file {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Session file {} is not JSON", path.display()))?;
    let state = match value {
        Value::Array(_) => {
            let cookies: Vec<Cookie> =
                serde_json::from_value(value).context("Invalid cookie array")?;
            SessionState::new(host, cookies)
        }
        other => serde_json::from_value(other).context("Invalid session state")?,
    };
    Ok(state)
}

pub async fn cmd_auth(config: &Config, command: AuthCommands) -> Result<i32> {
    let sessions = SessionManager::new(config.sessions_dir(), config.session_ttl());
    match command {
        AuthCommands::Import { host, file } => {
            let state = parse_session_file(&host, &file)?;
            let cookies = state.cookies.len();
            let path = sessions.import(&host, state).await?;
            print_json(&json!({
                "host": host,
                "path": path,
                "cookies": cookies,
            }))?;
        }
        AuthCommands::Status { host } => {
            let status = sessions.status(&host).await?;
            print_json(&status)?;
        }
    }
    Ok(EXIT_OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cookie_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, r#"[{"name": "li_at", "value": "abc"}]"#).unwrap();

        let state = parse_session_file("www.linkedin.com", &path).unwrap();
        assert_eq!(state.host, "www.linkedin.com");
        assert_eq!(state.cookies.len(), 1);
        assert_eq!(state.cookie_header().as_deref(), Some("li_at=abc"));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, "li_at=abc").unwrap();
        assert!(parse_session_file("www.linkedin.com", &path).is_err());
    }
}
