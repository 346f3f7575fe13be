mod common;

use std::time::Duration;

use icekit_device::{ConnectedDevice, PumpConfig, SimInfusionPump, SimPulseOximeter};
use icekit_kernel::{EventLoop, ServiceThread};
use icekit_middleware::{DomainBus, InstanceWriter};
use icekit_types::{
    AlarmLimit, GlobalAlarmLimitObjective, GlobalSimulationObjective, InfusionObjective, InfusionStatus,
    LimitType, LocalAlarmLimitObjective, PatientAlert, rosetta,
};

use common::{quiet_session, wait_for};

fn spo2_limit(limit_type: LimitType, value: f32) -> GlobalAlarmLimitObjective {
    GlobalAlarmLimitObjective {
        metric_id: rosetta::MDC_PULS_OXIM_SAT_O2.to_string(),
        limit_type,
        unit_identifier: rosetta::MDC_DIM_PERCENT.to_string(),
        value,
    }
}

#[test]
fn alarm_limit_objectives_drive_patient_alerts() -> Result<(), Box<dyn std::error::Error>> {
    let bus = DomainBus::default();
    let el = EventLoop::new();
    let _svc = ServiceThread::spawn(el.clone(), Duration::from_millis(20))?;
    let ox = SimPulseOximeter::new(bus.clone(), el.clone(), quiet_session())?;
    ox.connect("bench")?;

    let objectives = bus.writer::<GlobalAlarmLimitObjective>();
    let low = spo2_limit(LimitType::LowLimit, 90.0);
    let high = spo2_limit(LimitType::HighLimit, 100.0);
    let low_handle = objectives.register_instance(&low).ok_or("rejected")?;
    let high_handle = objectives.register_instance(&high).ok_or("rejected")?;
    objectives.write(&low, low_handle)?;
    objectives.write(&high, high_handle)?;
    assert!(wait_for(|| bus.live_instances::<AlarmLimit>().len() == 2));
    assert_eq!(bus.live_instances::<LocalAlarmLimitObjective>().len(), 2);

    let key = format!("{}-0", rosetta::MDC_PULS_OXIM_SAT_O2);
    let alert_text = || {
        bus.live_instances::<PatientAlert>()
            .into_iter()
            .find(|a| a.0.identifier == key)
            .map(|a| a.0.text)
    };

    ox.set_bpm_o2(70.0, 85.0)?;
    assert_eq!(alert_text().as_deref(), Some("LOW"));
    ox.set_bpm_o2(70.0, 95.0)?;
    assert_eq!(alert_text().as_deref(), Some("NORMAL"));

    let tighter = spo2_limit(LimitType::HighLimit, 94.0);
    objectives.write(&tighter, high_handle)?;
    assert!(wait_for(|| {
        bus.live_instances::<AlarmLimit>()
            .iter()
            .any(|l| l.limit_type == LimitType::HighLimit && l.value == 94.0)
    }));
    ox.set_bpm_o2(70.0, 95.0)?;
    assert_eq!(alert_text().as_deref(), Some("HIGH"));

    objectives.unregister_instance(low_handle);
    assert!(wait_for(|| bus.live_instances::<AlarmLimit>().len() == 1));
    assert_eq!(bus.live_instances::<LocalAlarmLimitObjective>().len(), 1);

    ox.disconnect()?;
    ox.shutdown();
    Ok(())
}

#[test]
fn simulation_objective_updates_numeric_while_connected() -> Result<(), Box<dyn std::error::Error>> {
    let bus = DomainBus::default();
    let el = EventLoop::new();
    let _svc = ServiceThread::spawn(el.clone(), Duration::from_millis(20))?;
    let ox = SimPulseOximeter::new(bus.clone(), el.clone(), quiet_session())?;
    ox.connect("bench")?;

    let writer = bus.writer::<GlobalSimulationObjective>();
    let objective = GlobalSimulationObjective {
        metric_id: rosetta::MDC_PULS_OXIM_PULS_RATE.to_string(),
        value: 120.0,
        ..Default::default()
    };
    let handle = writer.register_instance(&objective).ok_or("rejected")?;
    writer.write(&objective, handle)?;
    assert!(wait_for(|| ox.vital(icekit_device::Vital::PulseRate) == Some(120.0)));

    ox.disconnect()?;
    ox.shutdown();
    Ok(())
}

#[test]
fn infusion_objective_stops_only_the_addressed_pump() -> Result<(), Box<dyn std::error::Error>> {
    let bus = DomainBus::default();
    let el = EventLoop::new();
    let _svc = ServiceThread::spawn(el.clone(), Duration::from_millis(20))?;
    let config = PumpConfig {
        update_period: Duration::from_millis(20),
        resume_delay: Duration::from_millis(100),
        infusion_duration_seconds: 1000,
    };
    let pump = SimInfusionPump::new(bus.clone(), el.clone(), quiet_session(), config)?;
    pump.connect("pump")?;
    assert!(wait_for(|| pump.status().infusion_fraction_complete > 0.0));

    let objectives = bus.writer::<InfusionObjective>();
    let other = InfusionObjective {
        unique_device_identifier: "someone-else".to_string(),
        requestor: "test".to_string(),
        stop_infusion: true,
    };
    let other_handle = objectives.register_instance(&other).ok_or("rejected")?;
    objectives.write(&other, other_handle)?;

    let mut stop = InfusionObjective {
        unique_device_identifier: pump.session().udi(),
        requestor: "test".to_string(),
        stop_infusion: true,
    };
    let handle = objectives.register_instance(&stop).ok_or("rejected")?;
    objectives.write(&stop, handle)?;
    assert!(wait_for(|| pump.is_interlocked()));
    assert!(wait_for(|| !pump.status().infusion_active));
    let held = pump.status().infusion_fraction_complete;
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(pump.status().infusion_fraction_complete, held);

    stop.stop_infusion = false;
    objectives.write(&stop, handle)?;
    assert!(wait_for(|| !pump.is_interlocked()));
    assert!(wait_for(|| pump.status().infusion_active));

    let published = bus.live_instances::<InfusionStatus>();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].unique_device_identifier, pump.session().udi());

    pump.disconnect()?;
    let frozen = pump.status().infusion_fraction_complete;
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(pump.status().infusion_fraction_complete, frozen, "worker stops on disconnect");
    pump.shutdown();
    assert!(bus.live_instances::<InfusionStatus>().is_empty());
    Ok(())
}

#[test]
fn infusion_objective_applies_while_disconnected() -> Result<(), Box<dyn std::error::Error>> {
    let bus = DomainBus::default();
    let el = EventLoop::new();
    let _svc = ServiceThread::spawn(el.clone(), Duration::from_millis(20))?;
    let pump = SimInfusionPump::new(bus.clone(), el.clone(), quiet_session(), PumpConfig::default())?;
    assert!(!pump.is_infusing());

    let objectives = bus.writer::<InfusionObjective>();
    let stop = InfusionObjective {
        unique_device_identifier: pump.session().udi(),
        requestor: "test".to_string(),
        stop_infusion: true,
    };
    let handle = objectives.register_instance(&stop).ok_or("rejected")?;
    objectives.write(&stop, handle)?;
    assert!(wait_for(|| pump.is_interlocked()), "applied before connect");

    pump.connect("pump")?;
    pump.disconnect()?;
    let release = InfusionObjective {
        stop_infusion: false,
        ..stop.clone()
    };
    objectives.write(&release, handle)?;
    assert!(wait_for(|| !pump.is_interlocked()), "applied after disconnect");

    pump.shutdown();
    objectives.write(&stop, handle)?;
    std::thread::sleep(Duration::from_millis(100));
    assert!(!pump.is_interlocked(), "ignored after shutdown");
    Ok(())
}
