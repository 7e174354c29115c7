use std::collections::HashMap;

/// Command-line remapping support, following the ROS1 convention: tokens of
/// the form `key:=value` are remappings, `__`-prefixed keys are reserved
/// for node configuration, everything else passes through untouched.
#[derive(Debug, Default, Clone)]
pub struct ParsedArgs {
    pub name_override: Option<String>,
    pub namespace: Option<String>,
    pub master_uri: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub log_dir: Option<String>,
    pub remaps: Vec<(String, String)>,
    pub non_ros_args: Vec<String>,
}

pub fn parse_args<I, S>(args: I) -> ParsedArgs
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed = ParsedArgs::default();

    for arg in args {
        let arg = arg.as_ref();

        let Some((key, value)) = arg.split_once(":=") else {
            parsed.non_ros_args.push(arg.to_string());
            continue;
        };

        match key {
            "__name" => parsed.name_override = Some(value.to_string()),
            "__ns" => parsed.namespace = Some(value.to_string()),
            "__master" => parsed.master_uri = Some(value.to_string()),
            "__ip" => parsed.ip = Some(value.to_string()),
            "__hostname" => parsed.hostname = Some(value.to_string()),
            "__log" => parsed.log_dir = Some(value.to_string()),
            _ => parsed.remaps.push((key.to_string(), value.to_string())),
        }
    }

    parsed
}

/// Expands relative and private names and applies user remappings.
#[derive(Debug, Clone)]
pub struct NameResolver {
    namespace: String,
    node_name: String,
    remaps: HashMap<String, String>,
}

fn canonicalize(name: &str) -> String {
    let mut canonical = String::with_capacity(name.len() + 1);

    if !name.starts_with('/') {
        canonical.push('/');
    }
    canonical.push_str(name);

    while canonical.len() > 1 && canonical.ends_with('/') {
        canonical.pop();
    }

    canonical
}

impl NameResolver {
    /// `namespace` and `node_name` must already be canonical (the builder
    /// takes care of that); remap keys and values are expanded here so
    /// lookups can compare resolved forms.
    pub fn new(namespace: &str, node_name: &str, remaps: &[(String, String)]) -> Self {
        let namespace = canonicalize(namespace);
        let node_name = canonicalize(node_name);

        let mut resolver = NameResolver {
            namespace,
            node_name,
            remaps: HashMap::new(),
        };

        resolver.remaps = remaps
            .iter()
            .map(|(key, value)| (resolver.expand(key), resolver.expand(value)))
            .collect();

        resolver
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Expand a name without applying remappings: absolute names stay as
    /// they are, `~name` is private to the node, everything else lives in
    /// the node's namespace.
    fn expand(&self, name: &str) -> String {
        if name.is_empty() {
            return self.namespace.clone();
        }

        if let Some(private) = name.strip_prefix('~') {
            return canonicalize(&format!("{}/{}", self.node_name, private));
        }

        if name.starts_with('/') {
            return canonicalize(name);
        }

        if self.namespace == "/" {
            canonicalize(name)
        } else {
            canonicalize(&format!("{}/{}", self.namespace, name))
        }
    }

    /// Fully resolve a graph name: expansion followed by remapping.
    pub fn resolve(&self, name: &str) -> String {
        let expanded = self.expand(name);

        match self.remaps.get(&expanded) {
            Some(remapped) => remapped.clone(),
            None => expanded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_are_split_out() {
        let parsed = parse_args([
            "__name:=talker",
            "__ns:=/robot",
            "__master:=http://master:11311",
            "chatter:=/chat",
            "plain_arg",
            "--flag",
        ]);

        assert_eq!(parsed.name_override.as_deref(), Some("talker"));
        assert_eq!(parsed.namespace.as_deref(), Some("/robot"));
        assert_eq!(parsed.master_uri.as_deref(), Some("http://master:11311"));
        assert_eq!(
            parsed.remaps,
            vec![("chatter".to_string(), "/chat".to_string())]
        );
        assert_eq!(parsed.non_ros_args, vec!["plain_arg", "--flag"]);
    }

    #[test]
    fn relative_names_expand_in_namespace() {
        let resolver = NameResolver::new("/robot", "/robot/talker", &[]);

        assert_eq!(resolver.resolve("chatter"), "/robot/chatter");
        assert_eq!(resolver.resolve("/chatter"), "/chatter");
        assert_eq!(resolver.resolve("~debug"), "/robot/talker/debug");
    }

    #[test]
    fn remaps_match_resolved_names() {
        let remaps = vec![("chatter".to_string(), "/chat".to_string())];
        let resolver = NameResolver::new("/robot", "/robot/talker", &remaps);

        // Both the relative and the absolute spelling hit the same remap.
        assert_eq!(resolver.resolve("chatter"), "/chat");
        assert_eq!(resolver.resolve("/robot/chatter"), "/chat");
        assert_eq!(resolver.resolve("other"), "/robot/other");
    }

    #[test]
    fn root_namespace_does_not_double_slash() {
        let resolver = NameResolver::new("/", "/talker", &[]);

        assert_eq!(resolver.resolve("chatter"), "/chatter");
        assert_eq!(resolver.resolve(""), "/");
    }
}
