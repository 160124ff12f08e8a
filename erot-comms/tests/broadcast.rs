// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use erot_comms::error::BroadcastError;
use erot_comms::error::CommunicationError;
use erot_comms::error::RegistryError;
use erot_comms::error::TransportError;
use erot_comms::sim::SimConfig;
use erot_comms::sim::SimFaults;
use erot_comms::sim::SimulatedErot;
use erot_comms::BindingConfig;
use erot_comms::EndpointRegistry;
use erot_comms::RetryConfig;
use erot_comms::DEFAULT_EROT_EID;
use erot_messages::fw_update::FwUpdateCommand;
use erot_messages::MessageType;
use slog::o;
use slog::Discard;
use slog::Logger;

fn registry(capacity: usize) -> EndpointRegistry {
    EndpointRegistry::init(
        capacity,
        BindingConfig::default(),
        RetryConfig::default(),
        &Logger::root(Discard, o!()),
    )
}

#[tokio::test(start_paused = true)]
async fn probe_assigns_endpoint_id() {
    let sim = SimulatedErot::new(SimConfig::default());
    let mut registry = registry(1);
    let handle = registry
        .add_endpoint(Box::new(sim.clone()), 3, 7, Box::new(sim.clone()))
        .await
        .unwrap();
    assert_eq!(sim.eid(), DEFAULT_EROT_EID);

    let attributes = registry.get(handle).unwrap().attributes();
    assert_eq!(attributes.socket, 7);
    assert_eq!(attributes.name, "Erot7");
    assert_eq!(registry.get_by_socket(7), Some(handle));
}

#[tokio::test(start_paused = true)]
async fn silent_device_fails_probe() {
    let sim = SimulatedErot::new(SimConfig {
        faults: SimFaults { silent: true, ..Default::default() },
        ..Default::default()
    });
    let mut registry = registry(1);
    let err = registry
        .add_endpoint(Box::new(sim.clone()), 0, 0, Box::new(sim))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            RegistryError::Probe { socket: 0, err: TransportError::Timeout(_) }
        ),
        "{err:?}"
    );
    assert_eq!(registry.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn broadcast_continues_past_unresponsive_endpoint() {
    let sims: Vec<SimulatedErot> =
        (0..3).map(|_| SimulatedErot::new(SimConfig::default())).collect();
    let mut registry = registry(sims.len());
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
    sims[1].set_faults(SimFaults { silent: true, ..Default::default() });

    let mut validated = Vec::new();
    let results = registry
        .broadcast_request(
            MessageType::FwUpdate,
            FwUpdateCommand::QueryDeviceIdentifiers as u8,
            &[],
            256,
            |attributes, _request, response| {
                validated.push(attributes.socket);
                // completion code follows the three-byte header
                response.get(3) == Some(&0)
            },
        )
        .await;

    assert_eq!(validated, vec![0, 2]);
    assert_eq!(results.len(), 3);
    assert!(results[0].result.is_ok());
    assert!(matches!(
        results[1].result,
        Err(BroadcastError::Communication(
            CommunicationError::ExhaustedNumAttempts(3)
        ))
    ));
    assert_eq!(results[1].name, "Erot1");
    assert!(results[2].result.is_ok());
    for sim in [&sims[0], &sims[2]] {
        assert_eq!(
            sim.commands_received(),
            vec![FwUpdateCommand::QueryDeviceIdentifiers as u8]
        );
    }
}
