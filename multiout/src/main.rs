fn main() {
    if let Err(e) = multiout_lib::run() {
        eprintln!("multiout: {:#}", e);
        std::process::exit(1);
    }
}
