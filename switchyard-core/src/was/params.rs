//! Stock request parameters for CGI-style child processes.

use crate::address::CgiAddress;
use crate::hash::StringWithHash;
use crate::spawn::ChildOptions;
use crate::stock::StockKey;

/// Everything a WAS/FastCGI stock needs to spawn (and fingerprint) a
/// child process.
#[derive(Debug, Clone)]
pub struct CgiChildParams {
    pub executable_path: String,

    pub args: Vec<String>,

    pub options: ChildOptions,

    /// The maximum number of parallel child processes of this kind;
    /// 0 uses the stock default.
    pub parallelism: u32,

    /// The maximum number of concurrent connections per child (Multi
    /// protocol only).
    pub concurrency: u32,

    /// The child will likely be used only once; don't return it to
    /// the pool.
    pub disposable: bool,
}

impl CgiChildParams {
    pub fn new(address: &CgiAddress) -> Self {
        Self {
            executable_path: address.path.clone(),
            args: address.args.clone(),
            options: address.options.clone(),
            parallelism: address.parallelism,
            concurrency: address.concurrency,
            disposable: address.disposable,
        }
    }

    /// The pool fingerprint: a pure function of the spawn parameters,
    /// never of per-request data.
    pub fn stock_key(&self) -> StockKey {
        let mut b = String::new();
        b.push_str(&self.executable_path);

        for i in &self.args {
            b.push('!');
            b.push_str(i);
        }

        let mut options_id = String::new();
        self.options.make_id(&mut options_id);
        b.push_str(&options_id);

        StringWithHash::new(b)
    }

    /// Does the child use a pivot-root sandbox?  Jailed (per-account)
    /// children get a shorter idle TTL.
    pub fn is_jailed(&self) -> bool {
        self.options.ns.pivot_root.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CgiChildParams {
        let mut address = CgiAddress::new("/usr/lib/was/app");
        address.args.push("--threads=2".to_owned());
        CgiChildParams::new(&address)
    }

    #[test]
    fn key_is_deterministic() {
        assert_eq!(sample().stock_key(), sample().stock_key());
    }

    #[test]
    fn key_ignores_request_fields() {
        let mut address = CgiAddress::new("/usr/lib/was/app");
        address.args.push("--threads=2".to_owned());
        address.path_info = Some("/a/b".to_owned());
        address.query_string = Some("x=1".to_owned());

        assert_eq!(CgiChildParams::new(&address).stock_key(), sample().stock_key());
    }

    #[test]
    fn key_covers_options() {
        let mut params = sample();
        params.options.ns.enable_network = true;
        assert_ne!(params.stock_key(), sample().stock_key());
    }
}
