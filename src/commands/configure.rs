use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use crate::cli::ConfigureArgs;
use crate::commands::{emit, open_store};
use crate::model::ImportConfiguration;
use crate::service::Response;

pub fn run(args: ConfigureArgs) -> Result<()> {
    let store = open_store(&args.store)?;
    let mut settings = store.settings().context("failed to load import settings")?;
    let changed = apply(&mut settings, &args);

    if changed.is_empty() {
        info!("no settings changed");
    } else {
        store
            .save_settings(&settings)
            .context("failed to save import settings")?;
        info!(fields = ?changed, "updated import settings");
    }

    let mut shown = serde_json::to_value(&settings).context("failed to serialize settings")?;
    if settings.remote_token.is_some() {
        shown["remote_token"] = json!("<redacted>");
    }
    emit(&Response::ok(json!({ "changed": changed, "settings": shown })))
}

fn apply(settings: &mut ImportConfiguration, args: &ConfigureArgs) -> Vec<&'static str> {
    let mut changed = Vec::new();

    if let Some(value) = &args.remote_url {
        settings.remote_url = value.trim().to_string();
        changed.push("remote_url");
    }
    if let Some(value) = &args.remote_token {
        settings.remote_token = Some(value.trim().to_string()).filter(|token| !token.is_empty());
        changed.push("remote_token");
    } else if args.clear_remote_token {
        settings.remote_token = None;
        changed.push("remote_token");
    }
    if let Some(value) = &args.local_path {
        settings.local_path = value.trim().to_string();
        changed.push("local_path");
    }
    if let Some(value) = &args.local_root {
        settings.local_root = value.clone();
        changed.push("local_root");
    }
    if let Some(value) = &args.record_kind {
        settings.record_kind = value.trim().to_string();
        changed.push("record_kind");
    }
    if !args.required_fields.is_empty() {
        settings.required_fields = clean_fields(&args.required_fields);
        changed.push("required_fields");
    }
    if !args.known_fields.is_empty() {
        settings.known_fields = clean_fields(&args.known_fields);
        changed.push("known_fields");
    }
    if let Some(value) = &args.key_field {
        settings.key_field = value.trim().to_string();
        changed.push("key_field");
    }
    if let Some(value) = args.skip_duplicates {
        settings.skip_duplicates = value;
        changed.push("skip_duplicates");
    }
    if let Some(value) = args.delimiter {
        settings.delimiter = value;
        changed.push("delimiter");
    }
    if let Some(value) = args.max_memory_mb {
        settings.max_memory_mb = value;
        changed.push("max_memory_mb");
    }
    if let Some(value) = args.max_execution_secs {
        settings.max_execution_secs = value;
        changed.push("max_execution_secs");
    }
    if let Some(value) = args.sample_rows {
        settings.sample_rows = value;
        changed.push("sample_rows");
    }

    changed
}

/// Accepts repeated flags as well as comma-separated lists.
fn clean_fields(values: &[String]) -> Vec<String> {
    let mut fields = Vec::new();
    for field in values.iter().flat_map(|value| value.split(',')) {
        let field = field.trim();
        if !field.is_empty() && !fields.iter().any(|known: &String| known == field) {
            fields.push(field.to_string());
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Commands};

    fn parse(argv: &[&str]) -> ConfigureArgs {
        let mut full = vec!["csv-import", "configure"];
        full.extend_from_slice(argv);
        match Cli::parse_from(full).command {
            Commands::Configure(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn only_given_flags_change_settings() {
        let args = parse(&[
            "--local-path",
            " data/pages.csv ",
            "--known-field",
            "title,content",
            "--known-field",
            "slug",
            "--skip-duplicates",
            "false",
        ]);
        let mut settings = ImportConfiguration::default();

        let changed = apply(&mut settings, &args);

        assert_eq!(changed, vec!["local_path", "known_fields", "skip_duplicates"]);
        assert_eq!(settings.local_path, "data/pages.csv");
        assert_eq!(settings.known_fields, vec!["title", "content", "slug"]);
        assert!(!settings.skip_duplicates);
        assert_eq!(settings.required_fields, vec!["title"]);
    }

    #[test]
    fn remote_token_can_be_cleared() {
        let args = parse(&["--clear-remote-token"]);
        let mut settings = ImportConfiguration {
            remote_token: Some("secret".to_string()),
            ..ImportConfiguration::default()
        };

        assert_eq!(apply(&mut settings, &args), vec!["remote_token"]);
        assert_eq!(settings.remote_token, None);
    }
}
