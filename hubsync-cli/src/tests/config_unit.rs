//! Layered configuration tests for the `sync` command.

use ortho_config::MergeComposer;
use rstest::rstest;
use serde_json::json;

use super::*;
use crate::sync::config_from_layers_for_test;

#[rstest]
fn merge_layers_maps_configuration_errors() {
    let mut composer = MergeComposer::new();
    composer.push_cli(json!({ "page_size": "lots" }));

    let err = config_from_layers_for_test(composer.layers())
        .expect_err("invalid config layer should map to CliError::Configuration");
    match err {
        CliError::Configuration(_) => {}
        other => panic!("expected CliError::Configuration, found {other:?}"),
    }
}

#[rstest]
fn merge_layers_honour_precedence() {
    let mut composer = MergeComposer::new();
    composer.push_file(
        json!({
            "core_base_url": "https://from-file.example.com",
            "database": "/var/lib/hubsync/file.db",
            "page_size": 50,
        }),
        None,
    );
    composer.push_environment(json!({
        "table": "hubcheckout",
        "database": "/var/lib/hubsync/env.db",
    }));
    composer.push_cli(json!({
        "page_size": 10,
        "mode": "from_scratch",
    }));

    let config =
        config_from_layers_for_test(composer.layers()).expect("merged config should build");
    assert_eq!(config.table, "hubcheckout");
    assert_eq!(config.mode, hubsync_core::SyncMode::FromScratch);
    assert_eq!(config.engine.database.as_str(), "/var/lib/hubsync/env.db");
    assert_eq!(
        config.engine.core_base_url.as_deref(),
        Some("https://from-file.example.com")
    );
    assert_eq!(config.engine.options.page_size, 10);
}

#[rstest]
fn merge_layers_still_require_a_table() {
    let mut composer = MergeComposer::new();
    composer.push_file(json!({ "core_base_url": "https://core.example.com" }), None);

    let err = config_from_layers_for_test(composer.layers()).expect_err("table is required");
    assert!(matches!(
        err,
        CliError::MissingArgument { field, .. } if field == ARG_SYNC_TABLE
    ));
}
