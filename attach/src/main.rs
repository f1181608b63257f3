#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let code = netpol_attach::Args::parse_and_run().await;
    std::process::exit(code);
}
