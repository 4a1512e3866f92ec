// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    cli::Caps,
    device::{self, TpmDevice, TPM_CAP_PROPERTY_MAX},
    error::CliError,
    print::{label, print_algorithms, print_commands, print_handles, print_properties},
    Command,
};
use std::{
    io::Write,
    sync::{Arc, Mutex},
};
use tpm2_protocol::data::{TpmCap, TpmHt, TpmPt, TpmsCapabilityData, TpmuCapabilities};

/// Handle types listed by `caps -handles`, in output order.
const HANDLE_TYPES: [TpmHt; 7] = [
    TpmHt::Pcr,
    TpmHt::NvIndex,
    TpmHt::HmacSession,
    TpmHt::PolicySession,
    TpmHt::Permanent,
    TpmHt::Transient,
    TpmHt::Persistent,
];

/// First property past the fixed group.
const TPM_PT_VAR: u32 = 0x0000_0200;

type Renderer = fn(&mut TpmDevice, &mut dyn Write) -> Result<(), CliError>;

fn collect<T>(
    caps: Vec<TpmsCapabilityData>,
    pick: impl Fn(TpmuCapabilities) -> Option<Vec<T>>,
) -> Vec<T> {
    caps.into_iter()
        .filter_map(|cap| pick(cap.data))
        .flatten()
        .collect()
}

fn render_algorithms(device: &mut TpmDevice, writer: &mut dyn Write) -> Result<(), CliError> {
    let caps = device.get_capability(TpmCap::Algs, 0, TPM_CAP_PROPERTY_MAX)?;
    let algs = collect(caps, |data| match data {
        TpmuCapabilities::Algs(algs) => Some(algs.to_vec()),
        _ => None,
    });
    print_algorithms(writer, &algs)
}

fn render_handles(device: &mut TpmDevice, writer: &mut dyn Write) -> Result<(), CliError> {
    for ht in HANDLE_TYPES {
        let first = u32::from(ht.value()) << 24;
        let caps = device.get_capability(TpmCap::Handles, first, TPM_CAP_PROPERTY_MAX)?;
        let handles: Vec<u32> = collect(caps, |data| match data {
            TpmuCapabilities::Handles(handles) => Some(handles.iter().map(|h| h.value()).collect()),
            _ => None,
        })
        .into_iter()
        .filter(|&h| h >> 24 == u32::from(ht.value()))
        .collect();
        print_handles(writer, &handles)?;
    }
    Ok(())
}

fn render_commands(device: &mut TpmDevice, writer: &mut dyn Write) -> Result<(), CliError> {
    let caps = device.get_capability(TpmCap::Commands, 0, TPM_CAP_PROPERTY_MAX)?;
    let commands = collect(caps, |data| match data {
        TpmuCapabilities::Commands(commands) => Some(commands.to_vec()),
        _ => None,
    });
    print_commands(writer, &commands)
}

fn render_properties(device: &mut TpmDevice, writer: &mut dyn Write) -> Result<(), CliError> {
    let caps = device.get_capability(
        TpmCap::TpmProperties,
        TpmPt::FamilyIndicator.value(),
        TPM_CAP_PROPERTY_MAX,
    )?;
    let properties: Vec<_> = collect(caps, |data| match data {
        TpmuCapabilities::TpmProperties(props) => Some(props.to_vec()),
        _ => None,
    })
    .into_iter()
    .filter(|p| p.property.value() < TPM_PT_VAR)
    .collect();
    print_properties(writer, &properties)
}

impl Command for Caps {
    /// Runs `caps`.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the execution fails
    fn run<W: Write>(
        &self,
        device: Option<Arc<Mutex<TpmDevice>>>,
        writer: &mut W,
    ) -> Result<(), CliError> {
        let sections: [(bool, TpmCap, Renderer); 4] = [
            (self.algorithms, TpmCap::Algs, render_algorithms),
            (self.handles, TpmCap::Handles, render_handles),
            (self.commands, TpmCap::Commands, render_commands),
            (self.properties, TpmCap::TpmProperties, render_properties),
        ];

        let device = device::required(device)?;
        let mut device = device::lock(&device)?;
        for (selected, capability, render) in sections {
            if !(selected || self.all) {
                continue;
            }
            writeln!(writer, "{}:", label(capability))?;
            render(&mut *device, writer)?;
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }
}
