//! Simple example of using proxy-task-pool.

use proxy_task_pool::{
    parse_proxy_list, ConcurrencyBudget, ErrorClass, ExecutorConfig, ProxyPolicy, ProxyPool,
    RetryPolicy, TaskContext, TaskDescriptor, TaskExecutor,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    // host:port:user:pass, one per line
    let list = std::env::var("PROXY_LIST")
        .map(|path| std::fs::read_to_string(path))
        .unwrap_or_else(|_| Ok(String::new()))?;

    let pool = Arc::new(ProxyPool::default());
    pool.add(parse_proxy_list(&list));
    println!("Proxy pool: {:?}", pool.stats());

    let config = ExecutorConfig::builder()
        .budget(ConcurrencyBudget::new(2, 4))
        .retry(RetryPolicy::new(2, Duration::from_millis(500), Duration::from_secs(5)))
        .task_timeout(Duration::from_secs(15))
        // run direct when the list is empty
        .proxy_policy(ProxyPolicy::Optional)
        .progress_interval(Duration::from_secs(2))
        .build();
    let executor = TaskExecutor::new(pool, config);

    let tasks = (0..20)
        .map(|n| TaskDescriptor::new(format!("https://httpbin.org/anything/{n}")))
        .collect();

    println!("Running batch...");
    let results = executor
        .run(tasks, |ctx: TaskContext<String>| async move {
            let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));
            if let Some(proxy) = &ctx.proxy {
                builder = builder.proxy(proxy.to_reqwest_proxy().map_err(|e| ErrorClass::from_reqwest(&e))?);
            }
            let client = builder.build().map_err(|e| ErrorClass::from_reqwest(&e))?;
            let response = client
                .get(ctx.payload.as_str())
                .send()
                .await
                .map_err(|e| ErrorClass::from_reqwest(&e))?;
            if !response.status().is_success() {
                return Err(ErrorClass::from_status(response.status()));
            }
            Ok::<(), ErrorClass>(())
        })
        .await?;

    let stats = executor.stats();
    println!(
        "Done: {} results, {} succeeded, {} failed ({:.0}% success)",
        results.len(),
        stats.success,
        stats.fail,
        stats.success_rate * 100.0
    );
    executor.cleanup();

    Ok(())
}
