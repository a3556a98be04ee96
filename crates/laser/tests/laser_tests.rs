//! Fire-sequencing tests against the mock PWM backend.

use gpio_hal::MockGpio;
use laser::{LaserError, LaserLimits, LaserOutput, LaserSafetyController};
use std::sync::Arc;
use std::time::Duration;

const LASER_PIN: u8 = 18;

fn controller(max_power_pct: u8, limits: LaserLimits) -> (Arc<MockGpio>, Arc<LaserSafetyController>) {
    let gpio = Arc::new(MockGpio::new());
    let output = LaserOutput::new(gpio.as_ref(), LASER_PIN, 1000.0, max_power_pct).unwrap();
    (gpio.clone(), Arc::new(LaserSafetyController::new(output, limits)))
}

fn quick_limits() -> LaserLimits {
    LaserLimits {
        cooldown: Duration::from_millis(200),
        default_pulse: Duration::from_millis(30),
        max_pulse: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn fire_while_disarmed_is_rejected_and_never_touches_duty() {
    let (gpio, laser) = controller(100, quick_limits());
    let err = laser.fire(Duration::from_millis(30)).await.unwrap_err();
    assert!(matches!(err, LaserError::Disarmed));
    assert!(gpio.pwm_history(LASER_PIN).is_empty());
    assert_eq!(laser.status().fire_count, 0);
}

#[tokio::test]
async fn cooldown_refuses_a_second_fire_until_it_expires() {
    let (gpio, laser) = controller(100, quick_limits());
    laser.arm(true).unwrap();
    laser.set_power(60);

    laser.fire(Duration::from_millis(30)).await.unwrap();
    assert_eq!(gpio.pwm_history(LASER_PIN), vec![60.0, 0.0]);
    assert_eq!(laser.status().fire_count, 1);

    let err = laser.fire(Duration::from_millis(30)).await.unwrap_err();
    assert!(matches!(err, LaserError::Cooldown(_)));
    assert_eq!(laser.status().fire_count, 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    laser.fire(Duration::from_millis(30)).await.unwrap();
    assert_eq!(laser.status().fire_count, 2);
}

#[tokio::test]
async fn power_is_clamped_to_the_configured_ceiling() {
    let (gpio, laser) = controller(50, quick_limits());
    laser.arm(true).unwrap();
    assert_eq!(laser.set_power(80), 50);

    laser.fire(Duration::from_millis(20)).await.unwrap();
    assert_eq!(gpio.pwm_history(LASER_PIN), vec![50.0, 0.0]);
}

#[tokio::test]
async fn disarm_mid_burst_stops_between_pulses() {
    let (gpio, laser) = controller(100, quick_limits());
    laser.arm(true).unwrap();
    laser.set_power(40);

    // Pulses land at [0,60] and [120,180]; the disarm arrives inside the
    // second pulse, which completes before the sequence stops.
    let task = {
        let laser = laser.clone();
        tokio::spawn(async move {
            laser
                .burst(5, Duration::from_millis(60), Duration::from_millis(60))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    laser.arm(false).unwrap();

    let completed = task.await.unwrap().unwrap();
    assert_eq!(completed, 2);

    let state = laser.status();
    assert_eq!(state.fire_count, 2);
    assert!(!state.is_on);
    assert!(!state.armed);
    assert_eq!(state.power_pct, 0);
    assert_eq!(gpio.pwm_duty(LASER_PIN), Some(0.0));
}

#[tokio::test]
async fn second_fire_during_a_burst_is_busy() {
    let (_gpio, laser) = controller(100, quick_limits());
    laser.arm(true).unwrap();
    laser.set_power(30);

    let task = {
        let laser = laser.clone();
        tokio::spawn(async move {
            laser
                .burst(3, Duration::from_millis(50), Duration::from_millis(50))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let err = laser.fire(Duration::from_millis(10)).await.unwrap_err();
    assert!(matches!(err, LaserError::Busy));

    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn fire_duration_is_hard_capped() {
    let limits = LaserLimits {
        cooldown: Duration::from_millis(50),
        default_pulse: Duration::from_millis(30),
        max_pulse: Duration::from_millis(50),
    };
    let (gpio, laser) = controller(100, limits);
    laser.arm(true).unwrap();
    laser.set_power(70);

    let started = std::time::Instant::now();
    laser.fire(Duration::from_secs(10)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(gpio.pwm_duty(LASER_PIN), Some(0.0));
}

#[tokio::test]
async fn claim_reserves_the_laser_before_any_pulse_runs() {
    let (gpio, laser) = controller(100, quick_limits());
    laser.arm(true).unwrap();
    laser.set_power(30);

    // The reservation alone makes any other admission Busy, even though
    // nothing has fired yet.
    let claim = laser.claim().unwrap();
    assert!(matches!(laser.claim().unwrap_err(), LaserError::Busy));
    assert!(matches!(
        laser.fire(Duration::from_millis(10)).await.unwrap_err(),
        LaserError::Busy
    ));
    assert!(gpio.pwm_history(LASER_PIN).is_empty());

    laser.fire_claimed(claim, Duration::from_millis(20)).await.unwrap();
    assert_eq!(laser.status().fire_count, 1);
    assert_eq!(gpio.pwm_history(LASER_PIN), vec![30.0, 0.0]);
}

#[tokio::test]
async fn dropping_an_unconsumed_claim_releases_the_reservation() {
    let (gpio, laser) = controller(100, quick_limits());
    laser.arm(true).unwrap();
    laser.set_power(30);

    let claim = laser.claim().unwrap();
    drop(claim);

    // No pulse ran, so no cooldown either; the next fire is admitted.
    laser.fire(Duration::from_millis(20)).await.unwrap();
    assert_eq!(laser.status().fire_count, 1);
    assert_eq!(gpio.pwm_history(LASER_PIN), vec![30.0, 0.0]);
}

#[tokio::test]
async fn zero_pulse_burst_is_refused() {
    let (_gpio, laser) = controller(100, quick_limits());
    laser.arm(true).unwrap();
    let err = laser
        .burst(0, Duration::from_millis(10), Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, LaserError::InvalidRequest(_)));

    // Same through a reservation: the claim is given back on refusal.
    let claim = laser.claim().unwrap();
    let err = laser
        .burst_claimed(claim, 0, Duration::from_millis(10), Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, LaserError::InvalidRequest(_)));
    laser.claim().unwrap();
}
