use anyhow::Result;

fn main() -> Result<()> {
    modwarden::cli::run()
}
