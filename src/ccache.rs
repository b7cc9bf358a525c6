//! Reader for MIT Kerberos file credential caches (format versions 3 and 4).

use bytes::{Buf, Bytes};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const VERSION_3: u16 = 0x0503;
const VERSION_4: u16 = 0x0504;
const CONFIG_REALM: &str = "X-CACHECONF:";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unsupported credential cache version {0:#06x}")]
    UnsupportedVersion(u16),

    #[error("credential cache is truncated")]
    Truncated,

    #[error("cannot read credential cache: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub realm: String,
    pub components: Vec<String>,
}

impl Principal {
    fn is_config_entry(&self) -> bool {
        self.realm == CONFIG_REALM
    }

    /// `krbtgt/REALM@REALM`
    fn is_tgt_for(&self, realm: &str) -> bool {
        self.components.len() == 2
            && self.components[0] == "krbtgt"
            && self.components[1].eq_ignore_ascii_case(realm)
    }
}

#[derive(Debug, Clone)]
pub struct CachedTicket {
    pub client: Principal,
    pub server: Principal,
    pub end_time: SystemTime,
}

#[derive(Debug, Clone)]
pub struct CredentialCache {
    pub default_principal: Principal,
    pub tickets: Vec<CachedTicket>,
}

impl CredentialCache {
    pub async fn read_file(path: &Path) -> Result<Self, CacheError> {
        let data = tokio::fs::read(path).await?;
        Self::parse(Bytes::from(data))
    }

    pub fn parse(data: Bytes) -> Result<Self, CacheError> {
        let mut reader = Reader { buf: data };
        let version = reader.u16()?;
        if version != VERSION_3 && version != VERSION_4 {
            return Err(CacheError::UnsupportedVersion(version));
        }
        if version == VERSION_4 {
            let header_len = reader.u16()? as usize;
            reader.skip(header_len)?;
        }

        let default_principal = reader.principal()?;
        let mut tickets = Vec::new();
        while reader.buf.has_remaining() {
            tickets.push(reader.ticket(version)?);
        }

        Ok(Self {
            default_principal,
            tickets,
        })
    }

    /// End time of the realm's TGT, else of the earliest-expiring ticket.
    /// Cache configuration entries are ignored.
    pub fn ticket_end_time(&self, realm: &str) -> Option<SystemTime> {
        let tickets = self.tickets.iter().filter(|t| !t.server.is_config_entry());
        let mut earliest = None;
        for ticket in tickets {
            if ticket.server.is_tgt_for(realm) {
                return Some(ticket.end_time);
            }
            earliest = match earliest {
                Some(end) if end <= ticket.end_time => Some(end),
                _ => Some(ticket.end_time),
            };
        }
        earliest
    }
}

struct Reader {
    buf: Bytes,
}

impl Reader {
    fn need(&self, n: usize) -> Result<(), CacheError> {
        if self.buf.remaining() < n {
            Err(CacheError::Truncated)
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, CacheError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, CacheError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, CacheError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn skip(&mut self, n: usize) -> Result<(), CacheError> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    fn octets(&mut self) -> Result<Bytes, CacheError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self) -> Result<String, CacheError> {
        Ok(String::from_utf8_lossy(&self.octets()?).into_owned())
    }

    fn principal(&mut self) -> Result<Principal, CacheError> {
        let _name_type = self.u32()?;
        let count = self.u32()?;
        let realm = self.string()?;
        let components = (0..count)
            .map(|_| self.string())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Principal { realm, components })
    }

    fn ticket(&mut self, version: u16) -> Result<CachedTicket, CacheError> {
        let client = self.principal()?;
        let server = self.principal()?;

        // keyblock; version 3 writes the enctype twice
        self.u16()?;
        if version == VERSION_3 {
            self.u16()?;
        }
        self.octets()?;

        let _auth_time = self.u32()?;
        let _start_time = self.u32()?;
        let end_time = self.u32()?;
        let _renew_till = self.u32()?;
        let _is_skey = self.u8()?;
        let _flags = self.u32()?;

        for _ in 0..self.u32()? {
            self.u16()?;
            self.octets()?;
        }
        for _ in 0..self.u32()? {
            self.u16()?;
            self.octets()?;
        }
        self.octets()?;
        self.octets()?;

        Ok(CachedTicket {
            client,
            server,
            end_time: UNIX_EPOCH + Duration::from_secs(u64::from(end_time)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn put_octets(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    fn put_principal(buf: &mut BytesMut, realm: &str, components: &[&str]) {
        buf.put_u32(1);
        buf.put_u32(components.len() as u32);
        put_octets(buf, realm.as_bytes());
        for component in components {
            put_octets(buf, component.as_bytes());
        }
    }

    fn put_ticket(buf: &mut BytesMut, version: u16, server_realm: &str, server: &[&str], end: u32) {
        put_principal(buf, "CORP.EXAMPLE.COM", &["alice"]);
        put_principal(buf, server_realm, server);
        buf.put_u16(18);
        if version == VERSION_3 {
            buf.put_u16(18);
        }
        put_octets(buf, &[0u8; 32]);
        let start = end.saturating_sub(36000);
        buf.put_u32(start);
        buf.put_u32(start);
        buf.put_u32(end);
        buf.put_u32(end.saturating_add(3600));
        buf.put_u8(0);
        buf.put_u32(0x4081_0000);
        buf.put_u32(1);
        buf.put_u16(2);
        put_octets(buf, &[10, 0, 0, 1]);
        buf.put_u32(0);
        put_octets(buf, b"ticket");
        put_octets(buf, b"");
    }

    fn cache(version: u16) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u16(version);
        if version == VERSION_4 {
            // one kdc time-offset header tag
            buf.put_u16(12);
            buf.put_u16(1);
            buf.put_u16(8);
            buf.put_u32(0);
            buf.put_u32(0);
        }
        put_principal(&mut buf, "CORP.EXAMPLE.COM", &["alice"]);
        buf
    }

    #[test]
    fn tgt_end_time_from_version_4_cache() {
        let mut buf = cache(VERSION_4);
        put_ticket(&mut buf, VERSION_4, CONFIG_REALM, &["krb5_ccache_conf_data", "pa_type"], 0);
        put_ticket(&mut buf, VERSION_4, "CORP.EXAMPLE.COM", &["HTTP", "proxy.corp.example.com"], 1_700_000_000);
        put_ticket(&mut buf, VERSION_4, "CORP.EXAMPLE.COM", &["krbtgt", "CORP.EXAMPLE.COM"], 1_700_036_000);

        let cache = CredentialCache::parse(buf.freeze()).unwrap();
        assert_eq!(cache.default_principal.components, vec!["alice".to_string()]);
        assert_eq!(cache.tickets.len(), 3);
        assert_eq!(
            cache.ticket_end_time("corp.example.com"),
            Some(UNIX_EPOCH + Duration::from_secs(1_700_036_000))
        );
    }

    #[test]
    fn earliest_service_ticket_without_tgt() {
        let mut buf = cache(VERSION_3);
        put_ticket(&mut buf, VERSION_3, "CORP.EXAMPLE.COM", &["HTTP", "a"], 2_000_000);
        put_ticket(&mut buf, VERSION_3, "CORP.EXAMPLE.COM", &["HTTP", "b"], 1_000_000);

        let cache = CredentialCache::parse(buf.freeze()).unwrap();
        assert_eq!(
            cache.ticket_end_time("CORP.EXAMPLE.COM"),
            Some(UNIX_EPOCH + Duration::from_secs(1_000_000))
        );
    }

    #[test]
    fn only_config_entries_means_no_ticket() {
        let mut buf = cache(VERSION_4);
        put_ticket(&mut buf, VERSION_4, CONFIG_REALM, &["krb5_ccache_conf_data", "fast_avail"], 0);
        let cache = CredentialCache::parse(buf.freeze()).unwrap();
        assert_eq!(cache.ticket_end_time("CORP.EXAMPLE.COM"), None);
    }

    #[test]
    fn rejects_old_versions() {
        let data = Bytes::from_static(&[0x05, 0x02, 0, 0]);
        assert!(matches!(
            CredentialCache::parse(data),
            Err(CacheError::UnsupportedVersion(0x0502))
        ));
    }

    #[test]
    fn truncated_ticket_is_an_error() {
        let mut buf = cache(VERSION_4);
        put_ticket(&mut buf, VERSION_4, "CORP.EXAMPLE.COM", &["krbtgt", "CORP.EXAMPLE.COM"], 1_000_000);
        let len = buf.len();
        buf.truncate(len - 3);
        assert!(matches!(
            CredentialCache::parse(buf.freeze()),
            Err(CacheError::Truncated)
        ));
    }
}
