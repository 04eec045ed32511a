fn main() {
    if let Err(e) = kiosk_replay_lib::run() {
        eprintln!("kiosk-replay: {:#}", e);
        std::process::exit(1);
    }
}
