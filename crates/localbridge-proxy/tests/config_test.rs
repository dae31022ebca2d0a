use std::io::Write;

use localbridge_proxy::ProxyConfig;
use tempfile::NamedTempFile;

#[test]
fn test_yaml_file_overrides_env() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
backend_url: "http://127.0.0.1:8080/v1/chat/completions"
api_key: "from-file"
concurrency: 2
models:
  code: "qwen2.5-coder:14b"
  default: "mistral:7b"
"#
    )
    .unwrap();

    let env = |key: &str| match key {
        "PORT" => Some("9100".to_string()),
        "PROXY_API_KEY" => Some("from-env".to_string()),
        _ => None,
    };
    let config = ProxyConfig::from_lookup(env)
        .with_yaml_file(file.path())
        .unwrap();

    assert_eq!(config.port, 9100);
    assert_eq!(config.backend_url, "http://127.0.0.1:8080/v1/chat/completions");
    assert_eq!(config.api_key.as_deref(), Some("from-file"));
    assert_eq!(config.concurrency, 2);
    assert_eq!(config.models.code, "qwen2.5-coder:14b");
    assert_eq!(config.models.default, "mistral:7b");
    assert_eq!(config.queue_options().concurrency, 2);
}

#[test]
fn test_missing_yaml_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ProxyConfig::default()
        .with_yaml_file(dir.path().join("absent.yaml"))
        .unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_invalid_yaml_file_is_an_error() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "port: [not, a, number]").unwrap();

    let err = ProxyConfig::default()
        .with_yaml_file(file.path())
        .unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}
