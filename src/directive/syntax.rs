//! Attribute name grammar: `v-name:arg.mod1.mod2`, with `:arg` short for
//! `v-bind:arg` and `@arg` short for `v-on:arg`.

use regex::Regex;

lazy_static::lazy_static! {
    static ref NAMED_RE: Regex =
        Regex::new(r"^(?P<name>[a-z0-9_-]+)(?::(?P<arg>[^.]+))?(?P<mods>(?:\.[^.]+)*)$").unwrap();
    static ref SHORTHAND_RE: Regex =
        Regex::new(r"^(?P<arg>[^.]+)(?P<mods>(?:\.[^.]+)*)$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSyntax {
    /// The attribute name as written.
    pub attribute: String,
    /// Directive name without prefix: `bind`, `on`, `if`, `for`, ...
    pub name: String,
    pub arg: Option<String>,
    pub modifiers: Vec<String>,
    pub value: String,
}

impl AttributeSyntax {
    /// Parse an attribute as directive syntax. Plain attributes yield `None`.
    pub fn parse(attribute: &str, value: &str, prefix: &str) -> Option<Self> {
        let (name, rest) = if let Some(rest) = attribute.strip_prefix(':') {
            ("bind".to_string(), rest)
        } else if let Some(rest) = attribute.strip_prefix('@') {
            ("on".to_string(), rest)
        } else if let Some(rest) = attribute.strip_prefix(prefix).filter(|_| !prefix.is_empty()) {
            let caps = NAMED_RE.captures(rest)?;
            return Some(Self {
                attribute: attribute.to_string(),
                name: caps["name"].to_string(),
                arg: caps.name("arg").map(|m| m.as_str().to_string()),
                modifiers: modifiers(caps.name("mods").map_or("", |m| m.as_str())),
                value: value.to_string(),
            });
        } else {
            return None;
        };

        let caps = SHORTHAND_RE.captures(rest)?;
        Some(Self {
            attribute: attribute.to_string(),
            name,
            arg: Some(caps["arg"].to_string()),
            modifiers: modifiers(caps.name("mods").map_or("", |m| m.as_str())),
            value: value.to_string(),
        })
    }

    pub fn has_modifier(&self, modifier: &str) -> bool {
        self.modifiers.iter().any(|m| m == modifier)
    }
}

fn modifiers(mods: &str) -> Vec<String> {
    mods.split('.')
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_directive() {
        let syntax = AttributeSyntax::parse("v-on:keyup.enter.stop", "go()", "v-").unwrap();
        assert_eq!(syntax.name, "on");
        assert_eq!(syntax.arg.as_deref(), Some("keyup"));
        assert_eq!(syntax.modifiers, vec!["enter", "stop"]);
    }

    #[test]
    fn test_shorthands() {
        let bind = AttributeSyntax::parse(":class", "{ a: b }", "v-").unwrap();
        assert_eq!((bind.name.as_str(), bind.arg.as_deref()), ("bind", Some("class")));
        let on = AttributeSyntax::parse("@click.once", "n++", "v-").unwrap();
        assert_eq!(on.name, "on");
        assert!(on.has_modifier("once"));
    }

    #[test]
    fn test_plain_attribute_is_not_a_directive() {
        assert!(AttributeSyntax::parse("class", "x", "v-").is_none());
        assert!(AttributeSyntax::parse("data-v-x", "x", "v-").is_none());
        let model = AttributeSyntax::parse("v-model.lazy.trim", "name", "v-").unwrap();
        assert_eq!(model.arg, None);
        assert_eq!(model.modifiers, vec!["lazy", "trim"]);
    }
}
