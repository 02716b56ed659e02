fn main() {
    dotenv::dotenv().ok();

    if let Err(err) = vault_ingest::run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
