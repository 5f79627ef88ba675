fn main() {
    if let Err(err) = toolhub::cli::run() {
        tracing::error!(error = %err, "toolhub failed");
        std::process::exit(1);
    }
}
