use clap::Parser;
use plaid_sync_tool::{app::App, config::Config, logging, models::ToolInput};
use std::process::ExitCode;
use tracing::{error, info};

/// Run one sync tool against the configured storage and print its JSON output.
#[derive(Parser, Debug)]
#[command(name = "plaid-tool", version)]
struct Cli {
    /// Tool to run (sync_transactions, get_balance, register_item, remove_item, list_items)
    #[arg(required_unless_present_any = ["list", "rotate_keys"])]
    tool: Option<String>,

    /// Tool parameters as a JSON object
    #[arg(short, long, default_value = "{}")]
    params: String,

    /// List the available tools and exit
    #[arg(long)]
    list: bool,

    /// Re-encrypt stored credentials under the active key version
    #[arg(long)]
    rotate_keys: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init("warn");
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let app = match App::from_config(&config).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let code = run(&app, cli).await;
    app.shutdown().await;
    code
}

async fn run(app: &App, cli: Cli) -> ExitCode {
    if cli.list {
        return exit_code(print_json(&app.tools.list()));
    }

    if cli.rotate_keys {
        return match app.items.rotate_credentials().await {
            Ok(rotated) => {
                info!(rotated, "Credential rotation finished");
                exit_code(print_json(&serde_json::json!({ "rotated": rotated })))
            }
            Err(e) => {
                error!(error = %e, "Credential rotation failed");
                ExitCode::FAILURE
            }
        };
    }

    let parameters = match serde_json::from_str(&cli.params) {
        Ok(parameters) => parameters,
        Err(e) => {
            error!(error = %e, "--params must be valid JSON");
            return ExitCode::FAILURE;
        }
    };

    let input = ToolInput {
        tool_name: cli.tool.unwrap_or_default(),
        parameters,
    };
    let output = app.execute(&input).await;
    exit_code(print_json(&output) && output.success)
}

fn print_json<T: serde::Serialize>(value: &T) -> bool {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            true
        }
        Err(e) => {
            error!(error = %e, "Failed to render output");
            false
        }
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
