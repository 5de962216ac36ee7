//! Twilio credentials from the environment
//!
//! Kept in its own test binary, as a single test, because it mutates the
//! process environment.

use follower_gateway::infra::config::{ENV_ACCOUNT_SID, ENV_AUTH_TOKEN};
use follower_gateway::infra::Config;
use std::io::Write;
use tempfile::NamedTempFile;

const BASE: &str = r#"
[mqtt]
host = "localhost"
topic = "dwm/node/4685/uplink/location"

[device]
host = "127.0.0.1"

[zones]
destination = { x = 1.6, y = 3.0 }
origin = { x = 0.0, y = 0.0 }
tolerance = 0.3
"#;

fn config_file(notify: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{BASE}\n[notify]\nenabled = true\n{notify}").unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_credentials_from_environment() {
    std::env::set_var(ENV_ACCOUNT_SID, "AC-env");
    std::env::set_var(ENV_AUTH_TOKEN, "token-env");

    // File without credentials picks them up from the environment
    let file = config_file("");
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.notify_account_sid(), Some("AC-env"));
    assert_eq!(config.notify_auth_token(), Some("token-env"));

    // File values win over the environment
    let file = config_file("account_sid = \"AC-file\"\nauth_token = \"token-file\"\n");
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.notify_account_sid(), Some("AC-file"));
    assert_eq!(config.notify_auth_token(), Some("token-file"));

    // Only one of them in the file
    let file = config_file("account_sid = \"AC-file\"\n");
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.notify_account_sid(), Some("AC-file"));
    assert_eq!(config.notify_auth_token(), Some("token-env"));

    // Fallback defaults still see the environment
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.config_file(), "default");
    assert_eq!(config.notify_account_sid(), Some("AC-env"));
    assert_eq!(config.notify_auth_token(), Some("token-env"));

    // Empty variables count as unset
    std::env::set_var(ENV_ACCOUNT_SID, "");
    std::env::remove_var(ENV_AUTH_TOKEN);
    let config = Config::from_file(config_file("").path()).unwrap();
    assert_eq!(config.notify_account_sid(), None);
    assert_eq!(config.notify_auth_token(), None);
}
