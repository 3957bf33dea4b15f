use stress_test::{stress_test_replicas, stress_test_scaling, stress_test_writers};

fn main() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    if let Err(e) = rt.block_on(async_main()) {
        eprintln!("\n✗ Stress test failed: {}", e);
        std::process::exit(1);
    }
}

async fn async_main() -> Result<(), cinder_db::DbError> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            CINDER STRESS TESTS                             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: concurrent writers, small scale
    let stats = stress_test_writers(4, 200).await?;
    stats.print();

    // Test 2: concurrent writers, medium scale
    let stats = stress_test_writers(32, 500).await?;
    stats.print();

    // Test 3: replicas converging after random syncs
    let stats = stress_test_replicas(4, 100, 200).await?;
    stats.print();

    // Test 4: more replicas, more syncs
    let stats = stress_test_replicas(8, 200, 1000).await?;
    stats.print();

    // Test 5: scaling analysis
    stress_test_scaling(32, 8).await?;

    println!("\n✓ All stress tests completed successfully!");
    Ok(())
}
