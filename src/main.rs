fn main() {
    if let Err(e) = pdf_chat_lib::run() {
        eprintln!("pdf-chat: {}", e);
        std::process::exit(1);
    }
}
