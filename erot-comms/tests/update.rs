// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware updates run end to end against simulated EROTs.

use erot_comms::error::BadResponse;
use erot_comms::error::CommandFailure;
use erot_comms::error::TaskCreateError;
use erot_comms::error::UpdateError;
use erot_comms::sim::SimComponent;
use erot_comms::sim::SimConfig;
use erot_comms::sim::SimFaults;
use erot_comms::sim::SimulatedErot;
use erot_comms::BindingConfig;
use erot_comms::EndpointRegistry;
use erot_comms::ExecuteSummary;
use erot_comms::RetryConfig;
use erot_comms::TaskEngine;
use erot_comms::TaskStage;
use erot_comms::UpdateConfig;
use erot_messages::fw_update::descriptor_type;
use erot_messages::fw_update::completion;
use erot_messages::fw_update::ActivationMethods;
use erot_messages::fw_update::FdState;
use erot_messages::fw_update::FwUpdateCommand;
use erot_messages::fw_update::ResultCode;
use erot_messages::package::Package;
use erot_messages::CompletionCode;
use erot_messages::MessageType;
use slog::o;
use slog::Discard;
use slog::Logger;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

fn log() -> Logger {
    Logger::root(Discard, o!())
}

async fn registry_with(sims: &[SimulatedErot]) -> EndpointRegistry {
    let mut registry = EndpointRegistry::init(
        sims.len(),
        BindingConfig::default(),
        RetryConfig::default(),
        &log(),
    );
    for (socket, sim) in sims.iter().enumerate() {
        registry
            .add_endpoint(
                Box::new(sim.clone()),
                socket as u8,
                socket as u8,
                Box::new(sim.clone()),
            )
            .await
            .unwrap();
    }
    registry
}

fn faulty(faults: SimFaults) -> SimConfig {
    SimConfig { faults, ..Default::default() }
}

/// Updates a single simulated device from `package`.
async fn run_update(
    sim: &SimulatedErot,
    package: &[u8],
    config: UpdateConfig,
) -> ExecuteSummary {
    let mut registry = registry_with(&[sim.clone()]).await;
    let mut engine = TaskEngine::init(config, None, &log());
    let endpoint = registry.get_by_socket(0).unwrap();
    engine.create_task(&registry, endpoint, package).unwrap();
    engine.execute_all(&mut registry).await
}

fn commands(sim: &SimulatedErot) -> Vec<FwUpdateCommand> {
    sim.commands_received()
        .into_iter()
        .map(|c| FwUpdateCommand::from_repr(c).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn update_transfers_every_component() {
    let config = SimConfig::default();
    let package = config.matching_package(3000);
    let sim = SimulatedErot::new(config);
    let mut registry = registry_with(&[sim.clone()]).await;

    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let mut engine = TaskEngine::init(
        UpdateConfig::default(),
        Some(Box::new(move |percent| sink.lock().unwrap().push(percent))),
        &log(),
    );
    let endpoint = registry.get_by_socket(0).unwrap();
    engine.create_task(&registry, endpoint, &package).unwrap();

    let summary = engine.execute_all(&mut registry).await;
    assert!(summary.all_succeeded(), "{:?}", summary.first_error);
    assert_eq!(
        summary.activation_methods,
        ActivationMethods::MEDIUM_SPECIFIC_RESET
    );
    assert_eq!(summary.outcomes.len(), 1);
    assert_eq!(summary.outcomes[0].name, "Erot0");
    assert_eq!(summary.outcomes[0].stage, TaskStage::Activated);
    assert_eq!(sim.fd_state(), FdState::Idle);

    let parsed = Package::parse(&package).unwrap();
    let expected: Vec<Vec<u8>> =
        parsed.components().map(|c| parsed.image(&c).to_vec()).collect();
    assert_eq!(sim.received_images(), expected);

    let reports = reports.lock().unwrap();
    assert_eq!(reports.last(), Some(&100));
    assert!(reports.windows(2).all(|w| w[0] < w[1]));
    assert!(reports.iter().rev().skip(1).all(|p| *p <= 99));

    assert_eq!(
        commands(&sim),
        vec![
            FwUpdateCommand::QueryDeviceIdentifiers,
            FwUpdateCommand::GetFirmwareParameters,
            FwUpdateCommand::RequestUpdate,
            FwUpdateCommand::PassComponentTable,
            FwUpdateCommand::PassComponentTable,
            FwUpdateCommand::UpdateComponent,
            FwUpdateCommand::UpdateComponent,
            FwUpdateCommand::ActivateFirmware,
        ]
    );
    assert!(!engine.tasks()[0].firmware_parameters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn device_reported_activation_wins() {
    let config = SimConfig {
        modified_activation: Some(ActivationMethods::SYSTEM_REBOOT),
        ..Default::default()
    };
    let package = config.matching_package(100);
    let sim = SimulatedErot::new(config);
    let mut registry = registry_with(&[sim]).await;

    let mut engine = TaskEngine::init(UpdateConfig::default(), None, &log());
    let endpoint = registry.get_by_socket(0).unwrap();
    engine.create_task(&registry, endpoint, &package).unwrap();
    let summary = engine.execute_all(&mut registry).await;
    assert!(summary.all_succeeded());
    assert_eq!(summary.activation_methods, ActivationMethods::SYSTEM_REBOOT);
}

#[tokio::test(start_paused = true)]
async fn unmatched_package_stops_after_identification() {
    let package = SimConfig::default().matching_package(100);
    let sim = SimulatedErot::new(SimConfig {
        descriptors: vec![(
            descriptor_type::PCI_DEVICE_ID,
            0x9999u16.to_le_bytes().to_vec(),
        )],
        ..Default::default()
    });
    let mut registry = registry_with(&[sim.clone()]).await;

    let mut engine = TaskEngine::init(UpdateConfig::default(), None, &log());
    let endpoint = registry.get_by_socket(0).unwrap();
    engine.create_task(&registry, endpoint, &package).unwrap();
    let summary = engine.execute_all(&mut registry).await;

    assert!(matches!(summary.first_error, Some(UpdateError::NoMatchInPackage)));
    assert_eq!(summary.outcomes[0].stage, TaskStage::Created);
    assert_eq!(commands(&sim), vec![FwUpdateCommand::QueryDeviceIdentifiers]);
}

#[tokio::test(start_paused = true)]
async fn oversize_parameters_leave_buffer_untouched() {
    let config = SimConfig {
        faults: SimFaults { oversize_parameters: true, ..Default::default() },
        ..Default::default()
    };
    let package = config.matching_package(100);
    let sim = SimulatedErot::new(config);
    let mut registry = registry_with(&[sim.clone()]).await;

    let mut engine = TaskEngine::init(UpdateConfig::default(), None, &log());
    let endpoint = registry.get_by_socket(0).unwrap();
    engine.create_task(&registry, endpoint, &package).unwrap();
    let summary = engine.execute_all(&mut registry).await;

    match summary.first_error {
        Some(UpdateError::BufferTooSmall { len, capacity }) => {
            assert!(len > capacity);
            assert_eq!(capacity, 512);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(engine.tasks()[0].firmware_parameters().is_empty());
    assert_eq!(engine.tasks()[0].stage(), TaskStage::IdentifyMatched);
    assert_eq!(
        commands(&sim),
        vec![
            FwUpdateCommand::QueryDeviceIdentifiers,
            FwUpdateCommand::GetFirmwareParameters,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn refused_component_cancels_update() {
    let config = SimConfig {
        faults: SimFaults { will_not_update: true, ..Default::default() },
        ..Default::default()
    };
    let package = config.matching_package(100);
    let sim = SimulatedErot::new(config);
    let mut registry = registry_with(&[sim.clone()]).await;

    let mut engine = TaskEngine::init(UpdateConfig::default(), None, &log());
    let endpoint = registry.get_by_socket(0).unwrap();
    engine.create_task(&registry, endpoint, &package).unwrap();
    let summary = engine.execute_all(&mut registry).await;

    assert!(matches!(
        summary.first_error,
        Some(UpdateError::UpdateComponentWillNotUpdate { component: 0, code: 1 })
    ));
    let sent = commands(&sim);
    assert_eq!(sent.last(), Some(&FwUpdateCommand::CancelUpdate));
    assert!(!sent.contains(&FwUpdateCommand::CancelUpdateComponent));
    assert_eq!(sim.fd_state(), FdState::Idle);
}

#[tokio::test(start_paused = true)]
async fn failed_verify_cancels_component_and_update() {
    let config = SimConfig {
        faults: SimFaults { fail_verify: true, ..Default::default() },
        ..Default::default()
    };
    let package = config.matching_package(100);
    let sim = SimulatedErot::new(config);
    let mut registry = registry_with(&[sim.clone()]).await;

    let mut engine = TaskEngine::init(UpdateConfig::default(), None, &log());
    let endpoint = registry.get_by_socket(0).unwrap();
    engine.create_task(&registry, endpoint, &package).unwrap();
    let summary = engine.execute_all(&mut registry).await;

    assert!(matches!(
        summary.first_error,
        Some(UpdateError::VerifyCompleteFailed {
            component: 0,
            result: ResultCode::Vendor(0),
        })
    ));
    assert_eq!(summary.outcomes[0].stage, TaskStage::ComponentsTransferred);
    let sent = commands(&sim);
    assert!(sent.ends_with(&[
        FwUpdateCommand::CancelUpdateComponent,
        FwUpdateCommand::CancelUpdate,
    ]));
    assert_eq!(sim.fd_state(), FdState::Idle);
}

#[tokio::test(start_paused = true)]
async fn one_failure_does_not_stop_other_tasks() {
    let config = SimConfig::default();
    let package = config.matching_package(500);
    let silent = SimulatedErot::new(config.clone());
    let healthy = SimulatedErot::new(config);
    let mut registry = registry_with(&[silent.clone(), healthy.clone()]).await;
    silent.set_faults(SimFaults { silent: true, ..Default::default() });

    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let mut engine = TaskEngine::init(
        UpdateConfig::default(),
        Some(Box::new(move |percent| sink.lock().unwrap().push(percent))),
        &log(),
    );
    for endpoint in registry.handles().collect::<Vec<_>>() {
        engine.create_task(&registry, endpoint, &package).unwrap();
    }
    let summary = engine.execute_all(&mut registry).await;

    assert!(matches!(
        summary.first_error,
        Some(UpdateError::ReqRetriesExhausted {
            command: "query_device_identifiers",
            attempts: 3,
        })
    ));
    assert!(summary.outcomes[0].result.is_err());
    assert!(summary.outcomes[1].result.is_ok());
    assert_eq!(
        summary.activation_methods,
        ActivationMethods::MEDIUM_SPECIFIC_RESET
    );
    assert_eq!(healthy.received_images().len(), 2);

    let reports = reports.lock().unwrap();
    assert!(!reports.contains(&100));
}

#[test]
fn tasks_need_a_registered_endpoint_and_valid_package() {
    let registry = EndpointRegistry::init(
        1,
        BindingConfig::default(),
        RetryConfig::default(),
        &log(),
    );
    let mut other = EndpointRegistry::init(
        1,
        BindingConfig::default(),
        RetryConfig::default(),
        &log(),
    );
    let sim = SimulatedErot::new(SimConfig::default());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();
    let endpoint = runtime
        .block_on(other.add_endpoint(
            Box::new(sim.clone()),
            0,
            0,
            Box::new(sim),
        ))
        .unwrap();

    let package = SimConfig::default().matching_package(10);
    let mut corrupt = package.clone();
    corrupt[20] ^= 0xff;
    let mut engine = TaskEngine::init(UpdateConfig::default(), None, &log());
    assert!(matches!(
        engine.create_task(&registry, endpoint, &package),
        Err(TaskCreateError::UnknownEndpoint(0))
    ));

    assert!(matches!(
        engine.create_task(&other, endpoint, &corrupt),
        Err(TaskCreateError::Package(_))
    ));
    assert!(engine.create_task(&other, endpoint, &package).is_ok());
    assert_eq!(engine.tasks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn package_without_reported_components() {
    let other = SimConfig {
        components: vec![SimComponent {
            classification: 0x000a,
            identifier: 0x0030,
            classification_index: 0,
            active_version: "1.0.0".to_string(),
        }],
        ..Default::default()
    };
    let package = other.matching_package(100);
    let sim = SimulatedErot::new(SimConfig::default());
    let summary = run_update(&sim, &package, UpdateConfig::default()).await;

    assert!(matches!(
        summary.first_error,
        Some(UpdateError::NoUpdateComponents)
    ));
    assert_eq!(summary.outcomes[0].stage, TaskStage::ParametersRead);
    assert_eq!(
        commands(&sim),
        vec![
            FwUpdateCommand::QueryDeviceIdentifiers,
            FwUpdateCommand::GetFirmwareParameters,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn request_update_not_supported() {
    let config = faulty(SimFaults {
        request_update_unsupported: true,
        ..Default::default()
    });
    let package = config.matching_package(100);
    let sim = SimulatedErot::new(config);
    let summary = run_update(&sim, &package, UpdateConfig::default()).await;

    assert!(matches!(
        summary.first_error,
        Some(UpdateError::RequestUpdateUnsupported)
    ));
    assert_eq!(summary.outcomes[0].stage, TaskStage::ParametersRead);
    // nothing to cancel: the device never entered update mode
    assert_eq!(commands(&sim).last(), Some(&FwUpdateCommand::RequestUpdate));
}

#[tokio::test(start_paused = true)]
async fn device_metadata_request_is_unsupported() {
    let config =
        faulty(SimFaults { request_metadata: true, ..Default::default() });
    let package = config.matching_package(100);
    let sim = SimulatedErot::new(config);
    let summary = run_update(&sim, &package, UpdateConfig::default()).await;

    assert!(matches!(
        summary.first_error,
        Some(UpdateError::RequestUpdateUnsupported)
    ));
    assert_eq!(commands(&sim).last(), Some(&FwUpdateCommand::CancelUpdate));
    assert_eq!(sim.fd_state(), FdState::Idle);
}

#[tokio::test(start_paused = true)]
async fn refused_component_table_entry() {
    let config =
        faulty(SimFaults { refuse_components: true, ..Default::default() });
    let package = config.matching_package(100);
    let sim = SimulatedErot::new(config);
    let summary = run_update(&sim, &package, UpdateConfig::default()).await;

    assert!(
        matches!(
            summary.first_error,
            Some(UpdateError::PassComponentTableBadRsp {
                component: 0,
                err: BadResponse::Refused { response: 1, code: 0x06 },
            })
        ),
        "{:?}",
        summary.first_error
    );
    assert_eq!(summary.outcomes[0].stage, TaskStage::UpdateRequested);
    assert_eq!(commands(&sim).last(), Some(&FwUpdateCommand::CancelUpdate));
    assert_eq!(sim.fd_state(), FdState::Idle);
}

#[tokio::test(start_paused = true)]
async fn oversized_pull_fails_transfer() {
    let config = SimConfig { transfer_chunk: 8192, ..Default::default() };
    let package = config.matching_package(5000);
    let sim = SimulatedErot::new(config);
    let summary = run_update(&sim, &package, UpdateConfig::default()).await;

    assert_eq!(sim.data_refusals(), vec![completion::INVALID_TRANSFER_LENGTH]);
    assert!(matches!(
        summary.first_error,
        Some(UpdateError::TransferCompleteResultErr {
            component: 0,
            result: ResultCode::Standard(2),
        })
    ));
    assert_eq!(summary.outcomes[0].stage, TaskStage::ComponentsPassed);
    assert!(sim.received_images().is_empty());
    assert_eq!(sim.fd_state(), FdState::Idle);
}

#[tokio::test(start_paused = true)]
async fn pull_past_image_fails_transfer() {
    let config =
        faulty(SimFaults { pull_out_of_range: true, ..Default::default() });
    let package = config.matching_package(100);
    let sim = SimulatedErot::new(config);
    let summary = run_update(&sim, &package, UpdateConfig::default()).await;

    assert_eq!(sim.data_refusals(), vec![completion::DATA_OUT_OF_RANGE]);
    assert!(matches!(
        summary.first_error,
        Some(UpdateError::TransferCompleteResultErr { component: 0, .. })
    ));
    assert!(sim.commands_received().ends_with(&[
        FwUpdateCommand::CancelUpdateComponent as u8,
        FwUpdateCommand::CancelUpdate as u8,
    ]));
}

#[tokio::test(start_paused = true)]
async fn pull_after_transfer_is_refused() {
    let config = faulty(SimFaults { late_pull: true, ..Default::default() });
    let package = config.matching_package(100);
    let sim = SimulatedErot::new(config);
    let summary = run_update(&sim, &package, UpdateConfig::default()).await;

    // one refusal per component, then verification carries on
    assert!(summary.all_succeeded(), "{:?}", summary.first_error);
    assert_eq!(
        sim.data_refusals(),
        vec![completion::COMMAND_NOT_EXPECTED; 2]
    );
    assert_eq!(summary.outcomes[0].stage, TaskStage::Activated);
}

#[tokio::test(start_paused = true)]
async fn device_that_never_pulls_times_out() {
    let config =
        faulty(SimFaults { stall_transfer: true, ..Default::default() });
    let package = config.matching_package(100);
    let sim = SimulatedErot::new(config);
    let update = UpdateConfig {
        fd_idle_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let summary = run_update(&sim, &package, update).await;

    match summary.first_error {
        Some(UpdateError::RequestFwDataTimeout { component, timeout }) => {
            assert_eq!(component, 0);
            assert_eq!(timeout, Duration::from_secs(1));
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(commands(&sim).ends_with(&[
        FwUpdateCommand::CancelUpdateComponent,
        FwUpdateCommand::CancelUpdate,
    ]));
    assert_eq!(sim.fd_state(), FdState::Idle);
}

#[tokio::test(start_paused = true)]
async fn message_of_other_type_during_transfer() {
    let config = faulty(SimFaults {
        stray_request: Some((MessageType::Control, 0x02)),
        ..Default::default()
    });
    let package = config.matching_package(100);
    let sim = SimulatedErot::new(config);
    let summary = run_update(&sim, &package, UpdateConfig::default()).await;

    assert!(matches!(
        summary.first_error,
        Some(UpdateError::ReceiveBadType { msg_type: 0 })
    ));
    assert_eq!(sim.fd_state(), FdState::Idle);
}

#[tokio::test(start_paused = true)]
async fn host_command_sent_by_device() {
    let config = faulty(SimFaults {
        stray_request: Some((
            MessageType::FwUpdate,
            FwUpdateCommand::GetStatus as u8,
        )),
        ..Default::default()
    });
    let package = config.matching_package(100);
    let sim = SimulatedErot::new(config);
    let summary = run_update(&sim, &package, UpdateConfig::default()).await;

    assert!(matches!(
        summary.first_error,
        Some(UpdateError::UnsupportedCmd(0x1b))
    ));
    assert_eq!(summary.outcomes[0].stage, TaskStage::ComponentsPassed);
}

#[tokio::test(start_paused = true)]
async fn refused_activation() {
    let config =
        faulty(SimFaults { fail_activation: true, ..Default::default() });
    let package = config.matching_package(100);
    let sim = SimulatedErot::new(config);
    let summary = run_update(&sim, &package, UpdateConfig::default()).await;

    match &summary.first_error {
        Some(UpdateError::ActivateFwFailed(CommandFailure::Completion(code))) => {
            assert_eq!(*code, CompletionCode::ERROR);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(summary.outcomes[0].stage, TaskStage::Applied);
    assert_eq!(sim.received_images().len(), 2);
    assert_eq!(commands(&sim).last(), Some(&FwUpdateCommand::CancelUpdate));
    assert_eq!(sim.fd_state(), FdState::Idle);
}
