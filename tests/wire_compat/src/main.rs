fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use tunnelrelay_protocol::{Command, ListenerCommand};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn read_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        serde_json::from_str(&read_fixture(name))
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent comparison).
    fn roundtrip_test<T>(name: &str)
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  relay: {fixture}\n  Rust:  {reserialized}"
        );
    }

    #[test]
    fn fixture_accept_command_roundtrip() {
        roundtrip_test::<ListenerCommand>("accept_command.json");
    }

    #[test]
    fn fixture_renew_token_roundtrip() {
        roundtrip_test::<ListenerCommand>("renew_token.json");
    }

    #[test]
    fn fixture_accept_command_decodes() {
        let json = read_fixture("accept_command.json");
        let Command::Accept(accept) = Command::decode(json.as_bytes()).unwrap() else {
            panic!("expected an accept command");
        };
        assert_eq!(accept.id, "4cb542c3-047a-4d40-a19f-bdc66441e736_G3");
        assert!(accept.address.contains("sb-hc-action=accept"));
        assert_eq!(accept.connect_headers["X-Custom-Header"], "hello");
        let endpoint = accept.remote_endpoint.unwrap();
        assert_eq!((endpoint.address.as_str(), endpoint.port), ("10.1.2.3", 50123));
    }

    #[test]
    fn fixture_accept_command_without_optional_fields() {
        let Command::Accept(accept) =
            Command::decode(read_fixture("accept_command_minimal.json").as_bytes()).unwrap()
        else {
            panic!("expected an accept command");
        };
        assert_eq!(accept.id, "abc");
        assert!(accept.connect_headers.is_empty());
        assert!(accept.remote_endpoint.is_none());
    }

    #[test]
    fn fixture_renew_token_matches_encoder() {
        let fixture = load_fixture("renew_token.json");
        let token = fixture["renewToken"]["token"].as_str().unwrap();
        let encoded = Command::renew_token(token).encode().unwrap();
        let encoded: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(encoded, fixture);
    }

    #[test]
    fn fixture_unknown_command_is_not_fatal() {
        let raw = read_fixture("unknown_command.json");
        match Command::decode(raw.as_bytes()).unwrap() {
            Command::Unknown(text) => assert!(text.contains("\"request\"")),
            other => panic!("expected unknown command, got {other:?}"),
        }
    }
}
