use courier::transport::DryRunTransport;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // No real transport ships with the binary; it exercises the full claim and
    // bookkeeping path against the configured database.
    courier::run()
        .transport(DryRunTransport::new())
        .start()
        .await
}
