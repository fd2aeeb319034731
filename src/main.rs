mod app;

#[tokio::main]
async fn main() {
    let outcome = app::run().await;
    std::process::exit(outcome.exit_code());
}
