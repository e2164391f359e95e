use itertools::Itertools;

/// Convert an io::error to a string and strip "(os error 2)" from the end.
fn io_error_to_string(err: &std::io::Error) -> String {
    let s = err.to_string();
    s.strip_suffix(&format!(" (os error {})", err.raw_os_error().unwrap_or(0)))
        .unwrap_or(&s)
        .to_string()
}

/// Print an error chain.
pub fn print_error_chain(err: &anyhow::Error) {
    println!("{}", format_error_chain(err));
}

fn format_error_chain(err: &anyhow::Error) -> String {
    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
        let io_err_str = io_error_to_string(io_err);
        if err.chain().len() == 1 {
            return format!("ERROR: {io_err_str}");
        }
    }
    format!("ERROR: {}", err.chain().join("\n\tCaused by: "))
}
