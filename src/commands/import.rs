use std::fs;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::ImportArgs;
use crate::commands::dispatch;
use crate::mapping::ColumnMapping;
use crate::service::Request;

pub fn run(args: ImportArgs) -> Result<()> {
    let mapping = load_mapping(&args)?;
    info!(
        source = %args.source,
        explicit_mapping = mapping.is_some(),
        "import requested"
    );
    dispatch(&args.store, Request::StartImport {
        source: args.source,
        mapping,
    })
}

/// Builds the explicit mapping from `--mapping-file` and `--map` pairs; pairs
/// override file entries. `None` means the saved mapping is used.
fn load_mapping(args: &ImportArgs) -> Result<Option<ColumnMapping>> {
    let mut mapping = match &args.mapping_file {
        Some(path) => {
            let raw = fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let parsed: ColumnMapping = serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Some(parsed)
        }
        None => None,
    };

    for pair in &args.map {
        let Some((header, field)) = pair.split_once('=') else {
            bail!("invalid --map value {pair:?}; expected HEADER=FIELD");
        };
        let header = header.trim();
        if header.is_empty() {
            bail!("invalid --map value {pair:?}; header must not be empty");
        }
        let field = field.trim();
        mapping.get_or_insert_with(ColumnMapping::new).insert(
            header.to_string(),
            (!field.is_empty()).then(|| field.to_string()),
        );
    }

    Ok(mapping)
}
