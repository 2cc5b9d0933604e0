//! Job gateway server: `reelsmith serve`.

use anyhow::Result;

use reelsmith::config::Config;

pub async fn cmd_serve(
    config: &mut Config,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.toml.server.port = port;
    }
    if let Some(host) = host {
        config.toml.server.host = host;
    }
    if dev {
        config.toml.server.dev_mode = true;
    }

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("  - {}", problem);
        }
        anyhow::bail!(
            "Refusing to start with {} configuration problem(s). Run 'reelsmith config validate'.",
            problems.len()
        );
    }

    reelsmith::gateway::start_server(config).await
}
