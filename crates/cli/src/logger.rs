pub(crate) fn init(debug: bool, log_file: Option<&std::path::Path>) {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        std::env::var("WHAIS_LOG")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(log::LevelFilter::Info)
    };
    let dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}] {}", record.level(), message))
        })
        .level(level);
    let dispatch = match log_file.and_then(|path| fern::log_file(path).ok()) {
        Some(file) => dispatch.chain(file),
        None => dispatch.chain(std::io::stderr()),
    };
    let _ = dispatch.apply();
}
