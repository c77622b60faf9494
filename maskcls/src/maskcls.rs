fn main() -> anyhow::Result<()> {
    maskcls_core::run()
}
