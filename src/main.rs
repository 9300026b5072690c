fn main() {
    if let Err(err) = tabheal::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
