fn main() -> anyhow::Result<()> {
    trackshelf::cli::run()
}
