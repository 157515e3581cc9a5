//! MAC address helpers for guest NICs.

/// Generate a random MAC address in the QEMU/KVM `52:54:00` range.
pub fn generate_mac_address() -> String {
    let bytes: [u8; 3] = rand::random();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        bytes[0] & 0x3f,
        bytes[1],
        bytes[2]
    )
}

/// Parse a user supplied MAC address into lower-case colon form.
///
/// Accepts `:` or `-` separators. Returns `None` for malformed, multicast
/// or all-zero addresses.
pub fn normalize_mac(input: &str) -> Option<String> {
    let parts: Vec<&str> = input.trim().split([':', '-']).collect();
    if parts.len() != 6 {
        return None;
    }

    let mut octets = [0u8; 6];
    for (slot, part) in octets.iter_mut().zip(&parts) {
        if part.len() != 2 {
            return None;
        }
        *slot = u8::from_str_radix(part, 16).ok()?;
    }

    if octets[0] & 0x01 != 0 || octets == [0u8; 6] {
        return None;
    }

    Some(
        octets
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":"),
    )
}
