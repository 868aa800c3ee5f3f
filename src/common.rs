//! A library of routines commonly used by both the storage benchmark and the simulation sweep.

#[macro_use]
pub mod macros;

#[macro_use]
pub mod output;

use spurs::SshShell;

/// The default SSH port of frontends and deployed nodes.
pub const SSH_PORT: u16 = 22;

/// Deployed nodes are always accessed as root (kadeploy installs our key for root).
pub const DEPLOYED_USER: &str = "root";

/// How long to wait between attempts when a remote is not reachable yet.
pub const CONNECT_RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// How many times to try to connect before giving up.
pub const CONNECT_ATTEMPTS: usize = 6;

#[derive(Copy, Clone, Debug)]
pub struct Username<'u>(pub &'u str);

impl Username<'_> {
    pub fn as_str(&self) -> &str {
        self.0
    }
}

/// Where and as whom to log in.
#[derive(Clone, Debug)]
pub struct Login<'u, 'h> {
    pub username: Username<'u>,
    pub hostname: &'h str,
}

impl Login<'_, '_> {
    /// The `HOST:PORT` string to connect to.
    pub fn addr(&self) -> String {
        ssh_addr(self.hostname)
    }

    /// Connect to the remote, retrying a few times if it is not reachable yet.
    pub fn connect(&self) -> Result<SshShell, failure::Error> {
        let addr = self.addr();
        let mut attempt = 1;

        loop {
            match SshShell::with_default_key(self.username.as_str(), &addr) {
                Ok(shell) => return Ok(shell),
                Err(err) if attempt < CONNECT_ATTEMPTS => {
                    log::warn!(
                        "Unable to connect to {} (attempt {}/{}): {}",
                        addr,
                        attempt,
                        CONNECT_ATTEMPTS,
                        err
                    );
                    attempt += 1;
                    std::thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Returns `host` with the default SSH port appended if it does not have one.
pub fn ssh_addr(host: &str) -> String {
    if host.contains(':') {
        host.to_owned()
    } else {
        format!("{}:{}", host, SSH_PORT)
    }
}

/// The frontend machine of a testbed site, where reservations are made.
pub fn site_frontend(site: &str) -> String {
    format!("frontend.{}.grid5000.fr", site)
}

/// The storage server of a testbed site.
pub fn site_storage_server(site: &str) -> String {
    format!("storage5k.{}.grid5000.fr", site)
}

/// Check that `walltime` looks like `H:MM:SS`. Used as a `clap` validator.
pub fn is_walltime(walltime: String) -> Result<(), String> {
    let parts: Vec<_> = walltime.split(':').collect();

    let well_formed = parts.len() == 3
        && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        && parts[1].len() == 2
        && parts[2].len() == 2
        && parts[1] < "60"
        && parts[2] < "60";

    if well_formed {
        Ok(())
    } else {
        Err(format!("{:?} is not a walltime (H:MM:SS)", walltime))
    }
}

/// `clap` validator for unsigned integers.
pub fn is_usize(s: String) -> Result<(), String> {
    s.as_str()
        .parse::<usize>()
        .map(|_| ())
        .map_err(|e| format!("{:?}", e))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn walltimes() {
        assert!(is_walltime("00:10:00".into()).is_ok());
        assert!(is_walltime("2:00:00".into()).is_ok());
        assert!(is_walltime("120:59:59".into()).is_ok());

        assert!(is_walltime("10:00".into()).is_err());
        assert!(is_walltime("1:60:00".into()).is_err());
        assert!(is_walltime("1:5:00".into()).is_err());
        assert!(is_walltime("a:00:00".into()).is_err());
    }

    #[test]
    fn addresses() {
        assert_eq!(ssh_addr("node-1.lyon.grid5000.fr"), "node-1.lyon.grid5000.fr:22");
        assert_eq!(ssh_addr("localhost:2222"), "localhost:2222");
        assert_eq!(site_frontend("lyon"), "frontend.lyon.grid5000.fr");
        assert_eq!(site_storage_server("rennes"), "storage5k.rennes.grid5000.fr");
    }
}
