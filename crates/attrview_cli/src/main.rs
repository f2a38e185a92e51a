//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `attrview_core` linkage (`ping`, `version`).
//! - Render one stored attribute view to stdout as JSON. Unknown ids are an
//!   error; the CLI never creates attribute views.

use attrview_core::db::open_db_in_memory;
use attrview_core::{
    AttributeViewService, EngineConfig, JsonFileAvStore, RenderRequest, SqliteDocumentTree,
};
use std::path::PathBuf;
use std::process::ExitCode;

const USAGE: &str = "usage: attrview_cli ping | version | render <data_dir> <av_id> [page] [page_size]";

fn parse_number(value: Option<&String>, name: &str) -> Result<Option<usize>, String> {
    value
        .map(|raw| {
            raw.parse::<usize>()
                .map_err(|_| format!("{name} must be a positive integer, got `{raw}`"))
        })
        .transpose()
}

fn render(args: &[String]) -> Result<String, String> {
    let (Some(data_dir), Some(av_id)) = (args.first(), args.get(1)) else {
        return Err(USAGE.to_string());
    };
    let data_dir = std::fs::canonicalize(PathBuf::from(data_dir))
        .map_err(|err| format!("cannot open data dir `{data_dir}`: {err}"))?;
    let page = parse_number(args.get(2), "page")?.unwrap_or(1);
    let page_size = parse_number(args.get(3), "page_size")?;

    let config = EngineConfig {
        data_dir: data_dir.clone(),
        history_dir: data_dir.join("history"),
        ..EngineConfig::default()
    };
    config.validate().map_err(|err| err.to_string())?;

    // Empty document index: bound rows have no block and are left out.
    let conn = open_db_in_memory().map_err(|err| err.to_string())?;
    let service = AttributeViewService::new(
        JsonFileAvStore::new(data_dir),
        SqliteDocumentTree::new(&conn),
        config,
    );
    let request = RenderRequest {
        page,
        page_size,
        ..RenderRequest::default()
    };
    let table = service
        .render_stored(av_id, &request)
        .map_err(|err| err.to_string())?;
    serde_json::to_string_pretty(&table).map_err(|err| err.to_string())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("ping") => Ok(format!("attrview_core ping={}", attrview_core::ping())),
        Some("version") | None => Ok(format!(
            "attrview_core version={}",
            attrview_core::core_version()
        )),
        Some("render") => render(&args[1..]),
        Some(_) => Err(USAGE.to_string()),
    };
    match result {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}
