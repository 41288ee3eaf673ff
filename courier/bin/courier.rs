#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use courier::{Courier, locate_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = locate_config(|key| std::env::var(key).ok())?;
    let courier = Courier::from_file(&config_path)?;

    courier.run().await
}
