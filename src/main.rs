#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sensor_logger::run().await
}
