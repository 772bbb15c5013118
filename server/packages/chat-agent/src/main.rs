fn main() {
    if let Err(err) = chat_agent::cli::run_chat_agent() {
        tracing::error!(error = %err, "chat-agent failed");
        std::process::exit(1);
    }
}
