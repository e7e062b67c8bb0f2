#[tokio::main]
async fn main() {
    if let Err(e) = siteline_lib::run().await {
        tracing::error!("{}", e);
        eprintln!("siteline: {}", e);
        std::process::exit(1);
    }
}
