use anyhow::{anyhow, bail};

pub fn get_hostname(preferred: Option<String>) -> String {
    preferred.unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
}

/// Splits `host[:port]` into its parts.
///
/// IPv6 hosts need brackets to carry a port (`[::1]:22`); the brackets are removed. An
/// unbracketed IPv6 host (`::1`) has no port.
pub fn split_host_port(address: &str) -> anyhow::Result<(&str, Option<u16>)> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("Missing `]` in {address}"))?;
        return match rest.strip_prefix(':') {
            Some(port) => Ok((host, Some(parse_port(address, port)?))),
            None if rest.is_empty() => Ok((host, None)),
            None => bail!("Unexpected `{rest}` after `]` in {address}"),
        };
    }
    match address.split_once(':') {
        Some((host, port)) if !port.contains(':') => {
            Ok((host, Some(parse_port(address, port)?)))
        }
        _ => Ok((address, None)),
    }
}

fn parse_port(address: &str, port: &str) -> anyhow::Result<u16> {
    port.parse::<u16>().map_err(|e| anyhow!("Cannot parse port from {address}: {e:?}"))
}
