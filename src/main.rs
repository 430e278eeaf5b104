//! Clara Agent - AI 服务编排代理
//!
//! Usage:
//! - Normal mode: `clara-agent`
//! - With custom port: `clara-agent --port 19890`

use clara_agent::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("Clara Agent - AI 服务编排代理");
    println!();
    println!("USAGE:");
    println!("    clara-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port (default 9890, env PORT)");
    println!("    -h, --help       Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    CLARA_AGENT_API_KEY              API key for the x-api-key header");
    println!("    CLARA_FEATURES                   Optional services, comma separated");
    println!("    CLARA_PORT_PREEMPTION            allowlist | any | off");
    println!("    CLARA_GPU_INSTALL_RETRIES        Retries for transient GPU setup failures");
    println!("    RUST_LOG                         Log filter (default info)");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = parse_args();
    clara_agent::init_tracing();
    clara_agent::run_agent(config).await
}
