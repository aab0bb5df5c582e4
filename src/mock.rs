//! In-memory [`RegisterTransport`] for tests and GUI development.
//!
//! Plain registers behave like device memory: writes land in the holding bank
//! and reads return whatever is stored. A read address can additionally be
//! scripted with a sequence of blocks; each read pops one block and the last
//! one repeats forever.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::TransportError;
use crate::register_map::Bank;
use crate::transport::RegisterTransport;

/// A recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Read { bank: Bank, address: u16, count: u16 },
    Write { address: u16, values: Vec<u16> },
    Disconnect,
}

#[derive(Default)]
struct MockState {
    registers: HashMap<(Bank, u16), u16>,
    scripts: HashMap<(Bank, u16), VecDeque<Vec<u16>>>,
    short: Vec<(Bank, u16)>,
    failures: VecDeque<TransportError>,
    stalled: bool,
    calls: Vec<Call>,
}

/// Cloneable handle; every clone shares the same simulated device.
#[derive(Clone, Default)]
pub struct MockTransport {
    shared: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // a panicking test thread must not hide the state from the others
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_register(&self, bank: Bank, address: u16, value: u16) {
        self.lock().registers.insert((bank, address), value);
    }

    pub fn register(&self, bank: Bank, address: u16) -> u16 {
        self.lock()
            .registers
            .get(&(bank, address))
            .copied()
            .unwrap_or_default()
    }

    /// Replace the responses for reads starting at `address`.
    pub fn script<I>(&self, bank: Bank, address: u16, blocks: I)
    where
        I: IntoIterator<Item = Vec<u16>>,
    {
        self.lock()
            .scripts
            .insert((bank, address), blocks.into_iter().collect());
    }

    /// Reads at `address` return one word fewer than requested.
    pub fn respond_short(&self, bank: Bank, address: u16) {
        self.lock().short.push((bank, address));
    }

    /// Fail the next call with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, err: TransportError) {
        self.lock().failures.push_back(err);
    }

    /// Never complete reads and writes.
    pub fn stall(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn writes(&self) -> Vec<(u16, Vec<u16>)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Write { address, values } => Some((*address, values.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn reads(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::Read { .. }))
            .count()
    }

    fn record(&self, call: Call) -> Result<bool, TransportError> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        Ok(state.stalled)
    }
}

#[async_trait]
impl RegisterTransport for MockTransport {
    async fn read_registers(
        &mut self,
        bank: Bank,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if self.record(Call::Read { bank, address, count })? {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        let scripted = state.scripts.get_mut(&(bank, address)).and_then(|script| {
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        });
        let mut words = match scripted {
            Some(block) => block,
            None => (0..count)
                .map(|offset| {
                    state
                        .registers
                        .get(&(bank, address.wrapping_add(offset)))
                        .copied()
                        .unwrap_or_default()
                })
                .collect(),
        };
        words.resize(count as usize, 0);
        if state.short.contains(&(bank, address)) {
            words.pop();
        }
        Ok(words)
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), TransportError> {
        let call = Call::Write {
            address,
            values: values.to_vec(),
        };
        if self.record(call)? {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        for (offset, value) in values.iter().enumerate() {
            state
                .registers
                .insert((Bank::Holding, address.wrapping_add(offset as u16)), *value);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.lock().calls.push(Call::Disconnect);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripts_repeat_their_last_block() {
        let mut mock = MockTransport::new();
        mock.script(Bank::Input, 10, [vec![1], vec![2]]);

        assert_eq!(mock.read_registers(Bank::Input, 10, 1).await, Ok(vec![1]));
        assert_eq!(mock.read_registers(Bank::Input, 10, 1).await, Ok(vec![2]));
        assert_eq!(mock.read_registers(Bank::Input, 10, 1).await, Ok(vec![2]));
    }

    #[tokio::test]
    async fn writes_are_readable_from_the_holding_bank() {
        let mut mock = MockTransport::new();
        mock.write_registers(0x0811, &[1, 2, 3]).await.unwrap();

        assert_eq!(mock.read_registers(Bank::Holding, 0x0812, 2).await, Ok(vec![2, 3]));
        assert_eq!(mock.writes(), vec![(0x0811, vec![1, 2, 3])]);
    }
}
