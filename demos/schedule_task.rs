//! Schedules a single AI task against a running broker and prints its id.
//!
//! Usage: `schedule-task <generate|optimize|fusion|analyze|expand> <node_id> <project_id> <user_id> <prompt...>`

use std::env;
use std::sync::Arc;

use taskforge_broker::config::CoreConfig;
use taskforge_broker::connection::ConnectionManager;
use taskforge_broker::contracts::{Priority, TaskMetadata, TaskType};
use taskforge_broker::scheduler::AITaskScheduler;
use taskforge_broker::topology::TopologyManager;
use taskforge_broker::{init_tracing, AmqpBroker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = env::args().skip(1);
    let task_type = match args.next().as_deref() {
        Some("generate") => TaskType::Generate,
        Some("optimize") => TaskType::Optimize,
        Some("fusion") => TaskType::Fusion,
        Some("analyze") => TaskType::Analyze,
        Some("expand") => TaskType::Expand,
        _ => {
            eprintln!(
                "usage: schedule-task <generate|optimize|fusion|analyze|expand> <node_id> <project_id> <user_id> <prompt...>"
            );
            std::process::exit(2);
        }
    };
    let node_id = args.next().unwrap_or_else(|| "demo-node".to_string());
    let project_id = args.next().unwrap_or_else(|| "demo-project".to_string());
    let user_id = args.next().unwrap_or_else(|| "demo-user".to_string());
    let prompt: Vec<String> = args.collect();
    if prompt.is_empty() {
        eprintln!("at least one input is required");
        std::process::exit(2);
    }

    let config = CoreConfig::load()?;
    let connection = Arc::new(ConnectionManager::new(&config.connection_url, config.retry.clone(), config.heartbeat)?);
    let topology = Arc::new(TopologyManager::new(config.topology.clone(), config.dead_letter.clone())?);
    topology.initialize(&connection.channel().await?).await?;

    let broker = Arc::new(AmqpBroker::new(
        connection,
        config.retry.clone(),
        config.prefetch,
        config.scheduler.confirm_timeout,
    ));
    broker.connect().await?;
    let scheduler = AITaskScheduler::new(broker, config.scheduler.clone());

    let task_id = scheduler
        .schedule_task(
            task_type,
            prompt,
            node_id,
            project_id,
            user_id,
            Priority::Normal,
            None,
            TaskMetadata::default(),
        )
        .await?;

    println!("scheduled task {task_id}");
    Ok(())
}
