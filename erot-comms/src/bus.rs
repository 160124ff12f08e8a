// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Physical collaborators of a binding: the serial bus that moves one packet
//! per transaction, and the ready line the EROT asserts when it has a packet
//! for us.

use crate::error::BusError;
use async_trait::async_trait;

/// One bus shared by one or more EROTs, each behind its own chip select.
#[async_trait]
pub trait SpiBus: Send {
    /// Performs one transaction with the device behind `chip_select`.
    ///
    /// To send a packet, `tx` holds the packet and `rx` is empty. To receive,
    /// `tx` is empty and the device writes its pending packet into `rx`; the
    /// returned value is the number of bytes the device produced, which may
    /// exceed `rx.len()` (the excess is lost).
    async fn transact(
        &mut self,
        chip_select: u8,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<usize, BusError>;
}

/// Level-triggered input the EROT asserts while it has a packet queued.
pub trait ReadySignal: Send {
    fn is_asserted(&mut self) -> bool;
}

#[async_trait]
impl<T: SpiBus + ?Sized> SpiBus for Box<T> {
    async fn transact(
        &mut self,
        chip_select: u8,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<usize, BusError> {
        (**self).transact(chip_select, tx, rx).await
    }
}

impl<T: ReadySignal + ?Sized> ReadySignal for Box<T> {
    fn is_asserted(&mut self) -> bool {
        (**self).is_asserted()
    }
}
