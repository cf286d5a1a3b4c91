use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match syncagent::run_cli().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            syncagent::exit_code_for(&err)
        }
    }
}
