fn main() -> anyhow::Result<()> {
    rover_cam::cli::run()
}
