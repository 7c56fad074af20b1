use pressdev_core::paths::Paths;
use pressdev_core::services::runtime::Platform;
use pressdev_core::services::stack::DockerCompose;
use pressdev_core::supervisor::{Supervisor, SupervisorConfig};
use std::sync::Arc;

pub fn run(paths: &Paths, dist_url: Option<String>, platform: Option<String>) -> anyhow::Result<()> {
    let mut config = SupervisorConfig::new(paths.clone())?.with_env_overrides();
    if let Some(url) = dist_url {
        config.dist_url = url;
    }
    if let Some(tag) = platform {
        config.platform = Platform::from_tag(&tag);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let engine = Arc::new(DockerCompose::detect(&paths.tools_dir()));
        let mut supervisor = Supervisor::build(config, engine)?;
        supervisor.start()?;

        println!("pressdev is running. Press Ctrl-C to stop.");
        tokio::signal::ctrl_c().await?;

        supervisor.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}
