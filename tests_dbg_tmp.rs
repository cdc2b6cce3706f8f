use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

#[tokio::test(start_paused = true)]
async fn dbg_test() {
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let c2 = counter.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(30));
        ticker.tick().await;
        println!("first tick done at {:?}", tokio::time::Instant::now());
        loop {
            ticker.tick().await;
            println!("tick at {:?}", tokio::time::Instant::now());
            c2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    });
    tokio::time::advance(Duration::from_secs(31)).await;
    tokio::task::yield_now().await;
    println!("counter = {}", counter.load(std::sync::atomic::Ordering::SeqCst));
}
