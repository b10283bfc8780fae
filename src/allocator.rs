//! Port Allocator (C1).
//!
//! Pure functions over the configured candidate set and the currently-live
//! port pairs; callers are responsible for holding whatever lock makes the
//! "observe live state, then insert" step atomic (see [`crate::registry`]).

use crate::error::BrokerError;

/// Choose a free `sshd_port` from `opened_ports` and a free `local_port`
/// strictly above `max(opened_ports)`.
///
/// `live_sshd_ports` and `live_local_ports` must reflect every port currently
/// held by a live Connection *or* a pending reservation.
pub fn allocate(
    opened_ports: &[u16],
    live_sshd_ports: &[u16],
    live_local_ports: &[u16],
) -> Result<(u16, u16), BrokerError> {
    let sshd_port = opened_ports
        .iter()
        .copied()
        .find(|p| !live_sshd_ports.contains(p))
        .ok_or(BrokerError::ServerFull)?;

    let floor = opened_ports.iter().copied().max().unwrap_or(0);
    let mut local_port = floor.checked_add(1).ok_or(BrokerError::ServerFull)?;
    while live_local_ports.contains(&local_port) {
        local_port = local_port.checked_add(1).ok_or(BrokerError::ServerFull)?;
    }

    Ok((sshd_port, local_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_first_free_sshd_port() {
        let (sshd_port, local_port) = allocate(&[7857, 7858, 7859], &[7857], &[]).unwrap();
        assert_eq!(sshd_port, 7858);
        assert_eq!(local_port, 7860);
    }

    #[test]
    fn local_port_is_above_max_opened_port() {
        let (_, local_port) = allocate(&[7857, 7858, 7859], &[], &[]).unwrap();
        assert_eq!(local_port, 7860);
    }

    #[test]
    fn local_port_increments_past_collisions() {
        let (_, local_port) = allocate(&[7857], &[], &[7858, 7859]).unwrap();
        assert_eq!(local_port, 7860);
    }

    #[test]
    fn server_full_when_all_sshd_ports_taken() {
        let result = allocate(&[7857], &[7857], &[]);
        assert!(matches!(result, Err(BrokerError::ServerFull)));
    }

    #[test]
    fn first_port_chosen_when_nothing_is_live() {
        let (sshd_port, local_port) = allocate(&[7857, 7858, 7859], &[], &[]).unwrap();
        assert_eq!(sshd_port, 7857);
        assert_eq!(local_port, 7860);
    }
}
