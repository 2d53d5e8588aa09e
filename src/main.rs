use proof_batcher::server;

#[tokio::main]
async fn main() {
    if let Err(e) = server::run().await {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}
