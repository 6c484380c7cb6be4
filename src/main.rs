use std::process::ExitCode;

use acserver_manager_lib::{cli, init_logging};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    match cli::run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
