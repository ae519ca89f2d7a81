#[cfg(feature = "server")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cv_entitlements::server::run().await
}
