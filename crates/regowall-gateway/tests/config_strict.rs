#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::collections::HashMap;

use regowall_core::ErrorKind;
use regowall_gateway::config::{self, SecurityProtocol};

const MINIMAL: &str = r#"
version: 1
channel:
  endpoints: ["memory://local"]
"#;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

#[test]
fn deny_unknown_fields_nested() {
    let bad = r#"
version: 1
channel:
  endpoints: ["memory://local"]
  partitionz: 3 # typo should fail
"#;

    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn ok_minimal_config() {
    let cfg = config::load_from_str(MINIMAL).expect("must parse");
    assert_eq!(cfg.version, 1);
    assert_eq!(cfg.gateway.listen, "0.0.0.0:8080");
    assert_eq!(cfg.channel.topic, "firewall-policies");
    assert_eq!(cfg.policies.compile_interval_ms, 10_000);
    assert!(!cfg.producer.enabled);
    assert_eq!(cfg.producer.host_prefixes, vec!["www.", "activities."]);
}

#[test]
fn unsupported_version_and_ranges_are_rejected() {
    for bad in [
        "version: 2\nchannel: { endpoints: [\"memory://local\"] }\n",
        "version: 1\nchannel: { endpoints: [\"memory://local\"], partitions: 0 }\n",
        "version: 1\nchannel: { endpoints: [\"memory://local\"] }\npolicies: { compile_interval_ms: 5 }\n",
        "version: 1\nchannel: { endpoints: [\"memory://local\"] }\ngateway: { listen: \"nowhere\" }\n",
        "version: 1\nchannel: { endpoints: [\"memory://local\"] }\nproducer: { rate_per_sec: 0 }\n",
    ] {
        let err = config::load_from_str(bad).expect_err(bad);
        assert_eq!(err.kind(), ErrorKind::Config, "input: {bad}");
    }
}

#[test]
fn missing_endpoints_is_fatal() {
    let err = config::load_from_str("version: 1\n").expect_err("no endpoints");
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("REGOWALL_BUS_ENDPOINTS"));
}

#[test]
fn environment_supplies_endpoints_and_credentials() {
    let cfg = config::load_with_env(
        "version: 1\n",
        env(&[
            ("REGOWALL_BUS_ENDPOINTS", "broker-1:9092, broker-2:9092,"),
            ("REGOWALL_SECURITY_PROTOCOL", "sasl_ssl"),
            ("REGOWALL_SASL_MECHANISM", "PLAIN"),
            ("REGOWALL_SASL_USERNAME", "firewall"),
            ("REGOWALL_SASL_PASSWORD", "hunter2"),
        ]),
    )
    .unwrap();

    assert_eq!(cfg.channel.endpoints, vec!["broker-1:9092", "broker-2:9092"]);
    assert_eq!(cfg.channel.security_protocol, SecurityProtocol::SaslSsl);
    assert_eq!(cfg.channel.sasl_mechanism.as_deref(), Some("PLAIN"));

    let creds = cfg.channel.credentials.as_ref().unwrap();
    assert_eq!(creds.username, "firewall");
    assert_eq!(creds.password.expose(), "hunter2");

    // the password never reaches Debug output
    let dumped = format!("{cfg:?}");
    assert!(!dumped.contains("hunter2"));
    assert!(dumped.contains("***"));
}

#[test]
fn missing_credentials_force_plaintext() {
    let cfg = config::load_with_env(
        MINIMAL,
        env(&[
            ("REGOWALL_SECURITY_PROTOCOL", "SASL_SSL"),
            ("REGOWALL_SASL_USERNAME", "firewall"),
        ]),
    )
    .unwrap();

    assert_eq!(cfg.channel.security_protocol, SecurityProtocol::Plaintext);
    assert!(cfg.channel.credentials.is_none());
}

#[test]
fn unknown_security_protocol_in_env_is_fatal() {
    let err = config::load_with_env(MINIMAL, env(&[("REGOWALL_SECURITY_PROTOCOL", "TLS13")]))
        .expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::Config);
}
