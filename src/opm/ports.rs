//! Cross-process port leasing for locally served catalogs.
//!
//! Every worker on a host draws `opm serve` ports from the same configured ranges.
//! A port is leased when a test bind on it succeeds and the lock file
//! `{lock_dir}/iib_{purpose}_{port}.lock` could be created exclusively. The test
//! bind catches ports owned by unrelated processes. The lock file catches sibling
//! workers that bound the port at the same moment.

use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::error::{IibError, Result};
use crate::opm::{compare_versions, OpmContext};
use crate::state::WorkerState;

pub const OPM_PORT: &str = "opm_port";
pub const OPM_PPROF_PORT: &str = "opm_pprof_port";

/// Exclusive claim on one local TCP port for one purpose
#[derive(Debug)]
pub struct PortFileLock {
    purpose: String,
    port: u16,
    locked: bool,
    path: PathBuf,
}

impl PortFileLock {
    pub fn new(lock_dir: &Path, purpose: impl Into<String>, port: u16) -> Self {
        let purpose = purpose.into();
        let path = lock_dir.join(format!("iib_{}_{}.lock", purpose, port));
        Self {
            purpose,
            port,
            locked: false,
            path,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_acquire(&mut self) -> Result<()> {
        debug!("Attempt to lock port {}.", self.port);

        if self.locked {
            let msg = format!("Error: Port {} is already locked", self.port);
            error!("{}", msg);
            return Err(IibError::iib(msg));
        }

        // The test socket is closed when it goes out of scope
        if let Err(e) = TcpListener::bind((Ipv4Addr::LOCALHOST, self.port)) {
            let msg = format!("Port {} is already in use.", self.port);
            error!("{}: {}", msg, e);
            return Err(IibError::AddressAlreadyInUse(msg));
        }

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(_) => {
                self.locked = true;
                debug!("Port {} used as {} was locked.", self.port, self.purpose);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let msg = format!("Port {} is already locked by other IIB worker.", self.port);
                error!("{}", msg);
                Err(IibError::AddressAlreadyInUse(msg))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            let msg = format!("Attempt to unlock not-locked {}.", self);
            error!("{}", msg);
            return Err(IibError::iib(msg));
        }
        fs::remove_file(&self.path)?;
        self.locked = false;
        debug!("Port {} used as {} was unlocked.", self.port, self.purpose);
        Ok(())
    }
}

impl fmt::Display for PortFileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PortFileLock(port: {}, purpose: {}, locked: {})",
            self.port, self.purpose, self.locked
        )
    }
}

/// Hands out one set of unlocked candidate locks per attempt
#[derive(Debug)]
pub struct PortLeaseGenerator {
    lock_dir: PathBuf,
    stacks: VecDeque<Vec<u16>>,
    purposes: Vec<String>,
    attempts: usize,
}

impl PortLeaseGenerator {
    /// `stacks[i][j]` is the port for `purposes[j]` in attempt `i`
    pub fn new(lock_dir: impl Into<PathBuf>, stacks: Vec<Vec<u16>>, purposes: Vec<String>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            stacks: stacks.into(),
            purposes,
            attempts: 0,
        }
    }

    pub fn next_locks(&mut self) -> Result<Vec<PortFileLock>> {
        let Some(ports) = self.stacks.pop_front() else {
            let msg = format!("No free port has been found after {} attempts.", self.attempts);
            error!("{}", msg);
            return Err(IibError::iib(msg));
        };
        self.attempts += 1;
        Ok(self
            .purposes
            .iter()
            .zip(ports)
            .map(|(purpose, port)| PortFileLock::new(&self.lock_dir, purpose.as_str(), port))
            .collect())
    }
}

/// Ports leased for one call, keyed by purpose
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeasedPorts(BTreeMap<String, u16>);

impl LeasedPorts {
    pub fn get(&self, purpose: &str) -> Option<u16> {
        self.0.get(purpose).copied()
    }

    pub fn opm_port(&self) -> Result<u16> {
        self.get(OPM_PORT)
            .ok_or_else(|| IibError::iib("No port was leased for opm_port"))
    }

    /// Profiling port, absent when the opm binary is too old to support it
    pub fn pprof_port(&self) -> Option<u16> {
        self.get(OPM_PPROF_PORT)
    }
}

/// Locks held for one attempt; released on drop
#[derive(Default)]
struct LockSet {
    locks: Vec<PortFileLock>,
}

impl LockSet {
    fn ports(&self) -> LeasedPorts {
        LeasedPorts(
            self.locks
                .iter()
                .map(|lock| (lock.purpose.clone(), lock.port))
                .collect(),
        )
    }

    fn release(&mut self) -> Result<()> {
        let mut first_err = None;
        for mut lock in self.locks.drain(..) {
            if lock.is_locked() {
                if let Err(e) = lock.unlock() {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!("Failed to release port locks: {}", e);
        }
    }
}

/// Candidate port stacks for `purposes`, shuffled, with the purposes actually used
///
/// The profiling port is dropped when the opm binary is older than
/// `iib_opm_pprof_lock_required_min_version`.
pub async fn get_opm_port_stacks(
    state: &WorkerState,
    opm: &OpmContext,
    purposes: &[&str],
) -> Result<(Vec<Vec<u16>>, Vec<String>)> {
    let settings = &state.settings;
    let mut purposes: Vec<String> = purposes.iter().map(|p| p.to_string()).collect();

    if purposes.iter().any(|p| p == OPM_PPROF_PORT) {
        let version = opm.version_number(state).await?;
        if compare_versions(&version, &settings.iib_opm_pprof_lock_required_min_version)
            == Ordering::Less
        {
            purposes.retain(|p| p != OPM_PPROF_PORT);
        }
    }

    let ranges = purposes
        .iter()
        .map(|purpose| {
            settings
                .iib_opm_port_ranges
                .get(purpose)
                .map(|(start, end)| (*start..*end).collect::<Vec<u16>>())
                .ok_or_else(|| IibError::iib(format!("No port range is configured for {}", purpose)))
        })
        .collect::<Result<Vec<_>>>()?;

    let stack_count = ranges.iter().map(Vec::len).min().unwrap_or(0);
    let mut stacks: Vec<Vec<u16>> = (0..stack_count)
        .map(|i| ranges.iter().map(|range| range[i]).collect())
        .collect();
    stacks.shuffle(&mut rand::thread_rng());

    Ok((stacks, purposes))
}

/// Lease one port per purpose and run `f` with them
///
/// On contention, either while locking or reported by `f` as
/// `AddressAlreadyInUse`, the next candidate is tried. The leased locks are
/// always released before this returns.
pub async fn with_leased_ports<T, F, Fut>(
    state: &WorkerState,
    opm: &OpmContext,
    purposes: &[&str],
    mut f: F,
) -> Result<T>
where
    F: FnMut(LeasedPorts) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if purposes.is_empty() {
        return f(LeasedPorts::default()).await;
    }
    let (stacks, purposes) = get_opm_port_stacks(state, opm, purposes).await?;
    if purposes.is_empty() {
        // Only the profiling port was asked for and this opm cannot use it
        return f(LeasedPorts::default()).await;
    }
    let generator = PortLeaseGenerator::new(state.settings.lock_dir(), stacks, purposes);
    lease_ports(generator, f).await
}

/// Leasing loop over an explicit candidate sequence
pub async fn lease_ports<T, F, Fut>(mut generator: PortLeaseGenerator, mut f: F) -> Result<T>
where
    F: FnMut(LeasedPorts) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        let mut held = LockSet::default();
        let mut contended = false;
        for mut lock in generator.next_locks()? {
            match lock.lock_acquire() {
                Ok(()) => held.locks.push(lock),
                Err(e) if e.is_address_in_use() => {
                    contended = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if contended {
            held.release()?;
            continue;
        }

        let result = f(held.ports()).await;
        let released = held.release();
        match result {
            Err(e) if e.is_address_in_use() => {
                released?;
                info!("{} Trying another port.", e);
            }
            Err(e) => return Err(e),
            Ok(value) => {
                released?;
                return Ok(value);
            }
        }
    }
}
