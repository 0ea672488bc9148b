//! Layered configuration lookup: command line over environment over
//! the Z0 config file, gated per key by a security level.

use crate::z0::{canonical_key, Cursor, Node};

/// Which sources may supply a value. `password` is `SecureFlexible`
/// so it can never be read from the config file (which tends to get
/// committed); `SecureStrict` additionally refuses the command line
/// (visible in process listings).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    /// Environment only.
    SecureStrict,
    /// Command line and environment.
    SecureFlexible,
    /// Command line, environment and config file.
    All,
}

impl SecurityLevel {
    fn allows_cli(self) -> bool {
        !matches!(self, SecurityLevel::SecureStrict)
    }

    fn allows_z0(self) -> bool {
        matches!(self, SecurityLevel::All)
    }
}

const ENV_PREFIX: &str = "GITLIVE_";

pub struct ConfigReader {
    cli_args: Vec<String>,
    env_vars: Vec<(String, String)>,
    z0: Option<Node>,
}

impl ConfigReader {
    pub fn new(cli_args: Vec<String>, env_vars: Vec<(String, String)>, z0: Option<Node>) -> Self {
        ConfigReader {
            cli_args,
            env_vars,
            z0,
        }
    }

    /// Reader over the real process arguments and environment.
    pub fn from_process(z0: Option<Node>) -> Self {
        Self::new(
            std::env::args().skip(1).collect(),
            std::env::vars().collect(),
            z0,
        )
    }

    /// Look `name` up in every source the security level permits, in
    /// precedence order CLI > environment > config file.
    pub fn value(&self, name: &str, level: SecurityLevel) -> Option<String> {
        if level.allows_cli() {
            if let Some(value) = self.cli_value(name) {
                return Some(value);
            }
        }
        if let Some(value) = self.env_value(name) {
            return Some(value);
        }
        if level.allows_z0() {
            if let Some(value) = self.z0_value(name) {
                return Some(value);
            }
        }
        None
    }

    /// Command-line form is `--name=value`, equals-separated; the
    /// name is matched case/separator-insensitively.
    fn cli_value(&self, name: &str) -> Option<String> {
        let wanted = canonical_key(name);
        self.cli_args.iter().find_map(|arg| {
            let rest = arg.strip_prefix("--")?;
            let (arg_name, value) = rest.split_once('=')?;
            (canonical_key(arg_name) == wanted).then(|| value.to_owned())
        })
    }

    /// `GITLIVE_<NAME>` with `-` mapped to `_` and uppercased;
    /// fallback to a case-insensitive scan for platforms and callers
    /// that disagree about variable-name casing.
    fn env_value(&self, name: &str) -> Option<String> {
        let exact = format!("{ENV_PREFIX}{}", name.replace('-', "_").to_uppercase());
        if let Some((_, value)) = self.env_vars.iter().find(|(k, _)| *k == exact) {
            return Some(value.clone());
        }
        let wanted = canonical_key(&exact);
        self.env_vars
            .iter()
            .find(|(k, _)| canonical_key(k) == wanted)
            .map(|(_, v)| v.clone())
    }

    fn z0_value(&self, name: &str) -> Option<String> {
        self.z0_cursor().get(name).as_str().map(str::to_owned)
    }

    /// Direct access to the parsed config file (absent cursor when
    /// there is none), for structured values like the `files` array.
    pub fn z0_cursor(&self) -> Cursor<'_> {
        match &self.z0 {
            Some(root) => Cursor::new(root),
            None => Cursor::absent(),
        }
    }

    /// The LIVE repository URL; `public-url` is the key older configs
    /// used.
    pub fn url(&self) -> Option<String> {
        self.value("url", SecurityLevel::All)
            .or_else(|| self.value("public-url", SecurityLevel::All))
    }

    pub fn user(&self) -> Option<String> {
        self.value("user", SecurityLevel::All)
    }

    pub fn password(&self) -> Option<String> {
        self.value("password", SecurityLevel::SecureFlexible)
    }

    /// The file-selection rule strings from the config file, in
    /// order.
    pub fn files(&self) -> Vec<String> {
        self.z0_cursor()
            .get("files")
            .items()
            .filter_map(|item| item.as_str().map(str::to_owned))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::z0;

    fn reader(cli: &[&str], env: &[(&str, &str)], z0_text: Option<&str>) -> ConfigReader {
        ConfigReader::new(
            cli.iter().map(|s| (*s).to_owned()).collect(),
            env.iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            z0_text.map(|text| z0::parse(text).unwrap()),
        )
    }

    #[test]
    fn t_precedence_cli_env_z0() {
        let r = reader(
            &["--url=from-cli"],
            &[("GITLIVE_URL", "from-env")],
            Some("url = from-file\n"),
        );
        assert_eq!(r.value("url", SecurityLevel::All).unwrap(), "from-cli");

        let r = reader(&[], &[("GITLIVE_URL", "from-env")], Some("url = from-file\n"));
        assert_eq!(r.value("url", SecurityLevel::All).unwrap(), "from-env");

        let r = reader(&[], &[], Some("url = from-file\n"));
        assert_eq!(r.value("url", SecurityLevel::All).unwrap(), "from-file");
    }

    #[test]
    fn t_security_levels() {
        let r = reader(
            &["--password=cli-secret"],
            &[],
            Some("password = file-secret\n"),
        );
        // SecureFlexible: CLI yes, file never.
        assert_eq!(
            r.value("password", SecurityLevel::SecureFlexible).unwrap(),
            "cli-secret"
        );
        let r = reader(&[], &[], Some("password = file-secret\n"));
        assert_eq!(r.value("password", SecurityLevel::SecureFlexible), None);
        assert_eq!(r.password(), None);
        // SecureStrict: environment only.
        let r = reader(
            &["--token=cli"],
            &[("GITLIVE_TOKEN", "env")],
            Some("token = file\n"),
        );
        assert_eq!(r.value("token", SecurityLevel::SecureStrict).unwrap(), "env");
    }

    #[test]
    fn t_name_matching_is_case_and_separator_insensitive() {
        let r = reader(&["--Public-Url=x"], &[], None);
        assert_eq!(r.value("public_url", SecurityLevel::All).unwrap(), "x");

        let r = reader(&[], &[("gitlive_public_url", "y")], None);
        assert_eq!(r.value("public-url", SecurityLevel::All).unwrap(), "y");
    }

    #[test]
    fn t_cli_requires_equals_form() {
        let r = reader(&["--url", "space-separated"], &[], None);
        assert_eq!(r.value("url", SecurityLevel::All), None);
    }

    #[test]
    fn t_url_fallback_key() {
        let r = reader(&[], &[], Some("public-url = legacy\n"));
        assert_eq!(r.url().unwrap(), "legacy");
        let r = reader(&[], &[], Some("url = new\npublic-url = legacy\n"));
        assert_eq!(r.url().unwrap(), "new");
    }

    #[test]
    fn t_files_array() {
        let r = reader(&[], &[], Some("files:\n# = + *.md\n# = - secret.txt\n"));
        assert_eq!(r.files(), vec!["+ *.md", "- secret.txt"]);
        let r = reader(&[], &[], None);
        assert!(r.files().is_empty());
    }

    #[test]
    fn t_missing_everywhere() {
        let r = reader(&[], &[], None);
        assert_eq!(r.value("url", SecurityLevel::All), None);
        assert_eq!(r.url(), None);
    }
}
