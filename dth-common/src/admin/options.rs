//! Start options for managed services.

use crate::config::QaConfig;
use crate::errors::Result;
use crate::protocol::OverrideProvider;

/// `(service parameter, option name)` in the order options are emitted.
pub const OPTION_PARAMS: [(&str, &str); 7] = [
    ("serviceConfiguration", "configFile"),
    ("lookupGroups", "lookupGroups"),
    ("lookupLocators", "lookupLocators"),
    ("memberGroups", "memberGroups"),
    ("discoveryPort", "discoveryPort"),
    ("persistenceDir", "persistenceDir"),
    ("exporter", "exporter"),
];

/// Assemble the option list for instance `index` of `prefix`.
///
/// Parameters that are not configured are left out. Override-provider
/// contributions come last, in provider registration order.
pub fn build_options(
    config: &QaConfig,
    prefix: &str,
    index: usize,
    providers: &[OverrideProvider],
) -> Result<Vec<(String, String)>> {
    let mut options = Vec::new();
    for (param, name) in OPTION_PARAMS {
        if let Some(value) = config.get_service_param(prefix, param, index)? {
            options.push((name.to_string(), value));
        }
    }
    for provider in providers.iter().filter(|p| p.applies_to(prefix)) {
        for (key, value) in &provider.overrides {
            options.push((key.clone(), config.resolve(value)?));
        }
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_properties;

    #[test]
    fn test_options_follow_fixed_order_and_skip_missing() {
        let config = QaConfig::builder()
            .defaults(parse_properties(
                "reggie.exporter=tcp\n\
                 reggie.lookupGroups=qa.<gethost>\n\
                 reggie.type=activatable\n\
                 reggie.activatable.discoveryPort=4160\n\
                 reggie.memberGroups.1=second\n\
                 reggie.memberGroups=first\n",
            ))
            .build()
            .unwrap();
        let providers = vec![
            OverrideProvider {
                prefix: Some("reggie".into()),
                overrides: vec![("org.example.registrar.unicastPort".into(), "${reggie.activatable.discoveryPort}".into())],
            },
            OverrideProvider {
                prefix: Some("other".into()),
                overrides: vec![("ignored.x".into(), "1".into())],
            },
        ];

        let options = build_options(&config, "reggie", 1, &providers).unwrap();
        let names: Vec<&str> = options.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            [
                "lookupGroups",
                "memberGroups",
                "discoveryPort",
                "exporter",
                "org.example.registrar.unicastPort"
            ]
        );
        assert_eq!(options[0].1, format!("qa.{}", config.local_host()));
        assert_eq!(options[1].1, "second");
        assert_eq!(options[4].1, "4160");

        let first = build_options(&config, "reggie", 0, &[]).unwrap();
        assert_eq!(first[1], ("memberGroups".to_string(), "first".to_string()));
    }
}
