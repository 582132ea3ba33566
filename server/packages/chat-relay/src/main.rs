fn main() {
    if let Err(err) = chat_relay::cli::run_chat_relay() {
        tracing::error!(error = %err, "chat-relay failed");
        std::process::exit(1);
    }
}
