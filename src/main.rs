fn main() {
    if let Err(e) = ecg_monitor::run() {
        eprintln!("ecg-monitor: {e}");
        std::process::exit(1);
    }
}
