use storefront::Storefront;
use storefront::console;
use storefront::settings::SettingsStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let settings_store = SettingsStore::load();
    let settings = (*settings_store.settings()).clone();
    tracing::info!(config_path = ?settings_store.config_path(), "loaded settings");

    let storefront = match Storefront::open(settings).await {
        Ok(storefront) => storefront,
        Err(error) => {
            tracing::error!(error = %error, "failed to start storefront");
            std::process::exit(1);
        }
    };

    if let Err(error) = console::run(storefront).await {
        tracing::error!(error = %error, "console session ended with an error");
        std::process::exit(1);
    }
}
