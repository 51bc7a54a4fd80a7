#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy tests for the LobbyLink client.
//!
//! These tests parse `Cargo.toml` and verify that lint levels, feature
//! wiring and the fuzz harness conform to project policy. If any test fails,
//! the manifest has drifted from the agreed-upon standards.
//!
//! All checks are synchronous filesystem reads; no network access or async
//! runtime needed.

use std::path::PathBuf;

/// Returns the project root directory (where Cargo.toml lives).
fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// Reads and parses a TOML file relative to the project root.
fn read_manifest(relative_path: &str) -> toml::Table {
    let path = project_root().join(relative_path);
    let contents = std::fs::read_to_string(&path).unwrap_or_else(|e| {
        panic!(
            "Failed to read '{}': {}. This file is required by project policy.",
            path.display(),
            e
        )
    });
    toml::from_str(&contents)
        .unwrap_or_else(|e| panic!("'{}' is not valid TOML: {e}", path.display()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: panic_policy
// ─────────────────────────────────────────────────────────────────────────────

mod panic_policy {
    use super::*;

    const REQUIRED_DENY_LINTS: &[&str] = &[
        "unwrap_used",
        "expect_used",
        "panic",
        "todo",
        "unimplemented",
        "indexing_slicing",
    ];

    #[test]
    fn cargo_toml_denies_all_panic_prone_lints() {
        let cargo = read_manifest("Cargo.toml");
        let clippy = cargo["lints"]["clippy"]
            .as_table()
            .expect("Cargo.toml is missing a [lints.clippy] section");

        for lint in REQUIRED_DENY_LINTS {
            assert_eq!(
                clippy.get(*lint).and_then(toml::Value::as_str),
                Some("deny"),
                "[lints.clippy] must set `{lint} = \"deny\"` to enforce the \
                 panic-free policy in library code."
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: feature_policy
// ─────────────────────────────────────────────────────────────────────────────

mod feature_policy {
    use super::*;

    fn feature(cargo: &toml::Table, name: &str) -> Vec<String> {
        cargo["features"][name]
            .as_array()
            .unwrap_or_else(|| panic!("feature `{name}` is not declared"))
            .iter()
            .map(|v| v.as_str().unwrap().to_owned())
            .collect()
    }

    #[test]
    fn default_features_enable_both_network_surfaces() {
        let cargo = read_manifest("Cargo.toml");
        let default = feature(&cargo, "default");
        assert!(default.contains(&"transport-websocket".to_owned()));
        assert!(default.contains(&"rest-api".to_owned()));
    }

    #[test]
    fn network_crates_are_optional_and_gated() {
        let cargo = read_manifest("Cargo.toml");
        for dep in ["tokio-tungstenite", "futures-util", "reqwest"] {
            assert_eq!(
                cargo["dependencies"][dep]["optional"].as_bool(),
                Some(true),
                "`{dep}` must stay optional so the core builds without network crates"
            );
        }
        assert!(feature(&cargo, "transport-websocket").contains(&"dep:tokio-tungstenite".to_owned()));
        assert!(feature(&cargo, "rest-api").contains(&"dep:reqwest".to_owned()));
    }

    #[test]
    fn cli_demo_requires_the_websocket_transport() {
        let cargo = read_manifest("Cargo.toml");
        let demos = cargo["example"].as_array().expect("no [[example]] targets");
        let cli = demos
            .iter()
            .find(|d| d["name"].as_str() == Some("lobby_cli"))
            .expect("lobby_cli demo is not declared");
        assert_eq!(cli["path"].as_str(), Some("demos/lobby_cli.rs"));
        assert!(project_root().join("demos/lobby_cli.rs").is_file());
        assert_eq!(
            cli["required-features"].as_array().map(Vec::len),
            Some(1),
            "lobby_cli must require exactly the websocket transport"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: fuzz_policy
// ─────────────────────────────────────────────────────────────────────────────

mod fuzz_policy {
    use super::*;

    #[test]
    fn every_fuzz_target_has_a_source_file() {
        let fuzz = read_manifest("fuzz/Cargo.toml");
        let bins = fuzz["bin"].as_array().expect("fuzz/Cargo.toml declares no targets");
        assert!(!bins.is_empty());
        for bin in bins {
            let path = bin["path"].as_str().expect("fuzz target without a path");
            assert!(
                project_root().join("fuzz").join(path).is_file(),
                "fuzz target `{path}` has no source file"
            );
        }
    }

    #[test]
    fn fuzz_crate_builds_against_the_core_only() {
        let fuzz = read_manifest("fuzz/Cargo.toml");
        let core = &fuzz["dependencies"]["lobbylink-client"];
        assert_eq!(core["path"].as_str(), Some(".."));
        assert_eq!(core["default-features"].as_bool(), Some(false));
    }
}
