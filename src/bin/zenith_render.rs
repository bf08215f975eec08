//! Render a template against a JSON state file and print the resulting HTML.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use zenith_runtime::{diagnostics, App, AppConfig};

#[derive(Debug, Parser)]
#[command(name = "zenith-render", version, about = "Render a reactive HTML template once")]
struct Args {
    /// HTML template to mount. The `#app` element is used, else `<body>`.
    template: PathBuf,

    /// JSON object whose keys become the root bindings.
    #[arg(long)]
    state: Option<PathBuf>,

    /// JSON application config (delimiters, directive prefix, ...).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn read(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))
}

fn run(args: &Args) -> Result<String, String> {
    let template = read(&args.template)?;
    let config = match &args.config {
        Some(path) => AppConfig::from_json(&read(path)?).map_err(|e| e.to_string())?,
        None => AppConfig::default(),
    };
    let mut builder = App::builder().config(config);
    if let Some(path) = &args.state {
        builder = builder.state_json(&read(path)?).map_err(|e| e.to_string())?;
    }
    let app = builder.build().map_err(|e| e.to_string())?;
    app.mount_html(&template).map_err(|e| format!("[{}] {}", e.code(), e))?;
    app.tick();
    Ok(app.document_html().unwrap_or_else(|| app.html()))
}

fn main() -> ExitCode {
    diagnostics::init_tracing("warn");
    let args = Args::parse();
    match run(&args) {
        Ok(html) => {
            println!("{}", html);
            ExitCode::SUCCESS
        }
        Err(message) => {
            tracing::error!("{}", message);
            eprintln!("zenith-render: {}", message);
            ExitCode::FAILURE
        }
    }
}
