fn main() -> Result<(), Box<dyn std::error::Error>> {
    mcp_relay::cli::main()
}
