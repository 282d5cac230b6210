//! Per-connection symbol table, scoped by the MTA event stage that supplied
//! each symbol (`C`onnect, `H`elo, `M`ail, `R`cpt, `B`ody/data).

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

/// Stage codes in lookup order. A lookup scans all stages and returns the
/// first match, so connect-stage symbols win over later redefinitions.
const STAGE_ORDER: [char; 5] = ['C', 'H', 'M', 'R', 'B'];

#[derive(Debug, Default)]
pub struct SymbolTable {
    stages: BTreeMap<char, HashMap<String, String>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, stage: char, key: impl Into<String>, value: impl Into<String>) {
        self.stages
            .entry(stage)
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Bulk-load symbols for one stage, as delivered by a milter MACRO packet.
    pub fn set_all(&mut self, stage: char, symbols: impl IntoIterator<Item = (String, String)>) {
        let entry = self.stages.entry(stage).or_default();
        for (key, value) in symbols {
            trace!(stage = %stage, key, "symbol received");
            entry.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        STAGE_ORDER.iter().find_map(|stage| {
            self.stages
                .get(stage)
                .and_then(|symbols| symbols.get(key))
                .map(String::as_str)
        })
    }

    /// Drop message-scoped symbols, preserving connect-stage entries.
    pub fn clear_symbols(&mut self) {
        self.stages.retain(|stage, _| *stage == 'C');
    }

    pub fn clear_all_symbols(&mut self) {
        self.stages.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_scans_stages_in_order() {
        let mut symbols = SymbolTable::new();
        symbols.set('M', "i", "message-scoped");
        symbols.set('C', "i", "connect-scoped");

        assert_eq!(symbols.get("i"), Some("connect-scoped"));
        assert_eq!(symbols.get("missing"), None);
    }

    #[test]
    fn clear_preserves_connect_stage() {
        let mut symbols = SymbolTable::new();
        symbols.set('C', "j", "mail.example.com");
        symbols.set('M', "i", "4FE15A1");
        symbols.set('R', "rcpt_addr", "bob@example.net");

        symbols.clear_symbols();
        assert_eq!(symbols.get("j"), Some("mail.example.com"));
        assert_eq!(symbols.get("i"), None);
        assert_eq!(symbols.get("rcpt_addr"), None);

        symbols.clear_all_symbols();
        assert_eq!(symbols.get("j"), None);
    }
}
