#[tokio::main]
async fn main() {
    phrase_cache::init_tracing();

    match phrase_cache::run().await {
        Ok(report) => {
            tracing::info!(
                iterations = report.iterations,
                convergence = ?report.convergence,
                generated = report.generated,
                snapshots = report.snapshots,
                "done"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, retryable = e.is_retryable(), "rebuild failed");
            std::process::exit(1);
        }
    }
}
