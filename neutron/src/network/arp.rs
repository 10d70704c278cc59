//! Gratuitous ARP announcements.
//!
//! After an address is applied inside the container namespace, one broadcast
//! ARP request (sender = target = the new address) tells the segment's
//! neighbours to refresh their caches. Failure here never fails the command.

use std::mem;
use std::net::Ipv4Addr;

use nix::libc;

use crate::error::{Error, Result};

const ETH_ALEN: usize = 6;
const BROADCAST: [u8; ETH_ALEN] = [0xff; ETH_ALEN];

/// Send a single gratuitous ARP request for `ip` out of the interface with
/// the given index and MAC address. Must be called inside the namespace that
/// owns the interface.
pub fn gratuitous_arp(ifindex: u32, mac: &[u8; ETH_ALEN], ip: Ipv4Addr) -> Result<()> {
    let frame = build_frame(mac, ip);

    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            (libc::ETH_P_ARP as u16).to_be() as libc::c_int,
        )
    };
    if fd < 0 {
        return Err(Error::Io {
            context: "could not open a packet socket for ARP".into(),
            error: std::io::Error::last_os_error(),
        });
    }

    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
    addr.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
    addr.sll_ifindex = ifindex as libc::c_int;
    addr.sll_halen = ETH_ALEN as u8;
    addr.sll_addr[..ETH_ALEN].copy_from_slice(&BROADCAST);

    let rc = unsafe {
        libc::sendto(
            fd,
            frame.as_ptr() as *const libc::c_void,
            frame.len(),
            0,
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    let error = std::io::Error::last_os_error();
    unsafe { libc::close(fd) };

    if rc < 0 {
        return Err(Error::Io {
            context: format!("could not send gratuitous ARP for {}", ip),
            error,
        });
    }
    Ok(())
}

/// Ethernet header + ARP request, 42 bytes on the wire.
fn build_frame(mac: &[u8; ETH_ALEN], ip: Ipv4Addr) -> [u8; 42] {
    let mut frame = [0u8; 42];
    let spa = ip.octets();

    // Ethernet: broadcast destination, our source, ARP ethertype.
    frame[0..6].copy_from_slice(&BROADCAST);
    frame[6..12].copy_from_slice(mac);
    frame[12..14].copy_from_slice(&(libc::ETH_P_ARP as u16).to_be_bytes());

    // ARP request for our own address.
    frame[14..16].copy_from_slice(&1u16.to_be_bytes()); // hardware: ethernet
    frame[16..18].copy_from_slice(&(libc::ETH_P_IP as u16).to_be_bytes());
    frame[18] = ETH_ALEN as u8;
    frame[19] = 4; // protocol address length
    frame[20..22].copy_from_slice(&1u16.to_be_bytes()); // opcode: request
    frame[22..28].copy_from_slice(mac); // sender hardware address
    frame[28..32].copy_from_slice(&spa); // sender protocol address
    frame[32..38].copy_from_slice(&BROADCAST); // target hardware address
    frame[38..42].copy_from_slice(&spa); // target protocol address

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let mac = [0x02, 0x42, 0xac, 0x10, 0x1c, 0x96];
        let frame = build_frame(&mac, Ipv4Addr::new(172, 16, 28, 150));

        assert_eq!(&frame[0..6], &BROADCAST);
        assert_eq!(&frame[6..12], &mac);
        assert_eq!(&frame[12..14], &[0x08, 0x06]); // ETH_P_ARP
        assert_eq!(&frame[20..22], &[0x00, 0x01]); // request
        assert_eq!(&frame[28..32], &[172, 16, 28, 150]);
        assert_eq!(&frame[38..42], &[172, 16, 28, 150]);
    }
}
