use std::time::Duration;

use zimmer_koras_rs::*;

#[tokio::main]
async fn main() -> Result<(), GripperError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // pass a config file path to override the built-in defaults
    let config = match std::env::args().nth(1) {
        Some(path) => GripperConfig::load(path)?,
        None => GripperConfig::new(Model::Zimmer2Finger),
    };

    // connect to the endpoint of the configured model
    let gripper = GripperController::open(&config).await?;

    // watch state changes from another task
    let mut changes = gripper.subscribe();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let state = changes.borrow_and_update().clone();
            println!("state : {:?} {:?}", state.jaw, state.position);
        }
    });

    // Startup
    //
    // motor on (Zimmer), enable and initialize (KORAS)
    gripper.initialize().await?;
    gripper.home().await?;
    if let Some(diagnosis) = gripper.status().diagnosis {
        println!("diagnosis : {:#06x} {}", diagnosis.code, diagnosis.description);
    }

    // Set-points
    //
    // percent, applied to every following motion
    gripper.set_force(80).await?;
    gripper.set_velocity(50).await?;

    // Basic motion
    //
    let ack = gripper.grip().await?;
    println!("gripped at {:.2} mm after {} polls", ack.position, ack.polls);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let ack = gripper.release().await?;
    println!("released at {:.2} mm", ack.position);
    tokio::time::sleep(Duration::from_millis(500)).await;

    gripper.move_to(20.0).await?;

    // Emergency stop
    //
    // stop pre-empts a running motion from another handle
    let handle = gripper.clone();
    let motion = tokio::spawn(async move { handle.grip().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    gripper.stop().await?;
    match motion.await {
        Ok(Err(GripperError::Aborted)) => println!("grip aborted by stop"),
        Ok(other) => println!("grip ended with {other:?}"),
        Err(err) => println!("grip task failed: {err}"),
    }

    // Faults
    //
    if let Some(fault) = gripper.status().fault {
        println!("device fault : {fault}");
        gripper.clear_fault().await?;
    }

    println!("final state : {:?}", gripper.refresh().await?);
    gripper.disconnect().await;

    Ok(())
}
