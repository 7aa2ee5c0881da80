//! Engine function and constant declarations.
//!
//! A table is built from a declaration file (`nwscript.nss`): every function
//! prototype becomes an engine routine numbered by its position, and every
//! global with a literal initializer becomes a constant. Tables are
//! immutable once built and shared through [`DeclarationCache`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::ast::{ExprKind, Item, Param};
use super::error::CompileError;
use super::parser::parse_source;
use super::types::NssType;
use crate::game::GameVariant;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineFunction {
    pub name: String,
    pub routine: u16,
    pub return_type: NssType,
    pub params: Vec<Param>,
}

impl EngineFunction {
    /// Parameters that must be supplied by the caller.
    pub fn required_params(&self) -> usize {
        self.params.iter().take_while(|p| p.default.is_none()).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i32),
    Float(f32),
    String(String),
    Object(i32),
}

impl ConstValue {
    pub fn ty(&self) -> NssType {
        match self {
            ConstValue::Int(_) => NssType::Int,
            ConstValue::Float(_) => NssType::Float,
            ConstValue::String(_) => NssType::String,
            ConstValue::Object(_) => NssType::Object,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeclarationTable {
    functions: IndexMap<String, EngineFunction>,
    constants: IndexMap<String, ConstValue>,
    by_routine: HashMap<u16, String>,
}

impl DeclarationTable {
    pub fn parse(source: &str) -> Result<Self, Vec<CompileError>> {
        let script = parse_source(source)?;
        let mut table = Self::default();
        let mut errors = Vec::new();

        for item in script.items {
            match item {
                Item::Function(f) => {
                    let Ok(routine) = u16::try_from(table.functions.len()) else {
                        errors.push(CompileError::semantic("too many engine routines", f.span));
                        break;
                    };
                    if table.functions.contains_key(&f.name) {
                        errors.push(CompileError::semantic(
                            format!("engine function '{}' declared twice", f.name),
                            f.span,
                        ));
                        continue;
                    }
                    table.by_routine.insert(routine, f.name.clone());
                    table.functions.insert(
                        f.name.clone(),
                        EngineFunction {
                            name: f.name,
                            routine,
                            return_type: f.return_type,
                            params: f.params,
                        },
                    );
                }
                Item::Global(decl) => {
                    for d in decl.declarators {
                        let Some(init) = d.init else { continue };
                        match literal_value(&init.kind, &decl.ty) {
                            Some(value) => {
                                table.constants.insert(d.name, value);
                            }
                            None => errors.push(CompileError::semantic(
                                format!("constant '{}' needs a literal initializer", d.name),
                                d.span,
                            )),
                        }
                    }
                }
                Item::Struct(s) => errors.push(CompileError::semantic(
                    "declaration files cannot define structs",
                    s.span,
                )),
            }
        }

        if errors.is_empty() {
            log::debug!(
                "declaration table: {} routines, {} constants",
                table.functions.len(),
                table.constants.len()
            );
            Ok(table)
        } else {
            Err(errors)
        }
    }

    pub fn function(&self, name: &str) -> Option<&EngineFunction> {
        self.functions.get(name)
    }

    pub fn by_routine(&self, routine: u16) -> Option<&EngineFunction> {
        self.by_routine
            .get(&routine)
            .and_then(|name| self.functions.get(name))
    }

    pub fn constant(&self, name: &str) -> Option<&ConstValue> {
        self.constants.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name) || self.constants.contains_key(name)
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }
}

fn literal_value(kind: &ExprKind, ty: &NssType) -> Option<ConstValue> {
    match (kind, ty) {
        (ExprKind::IntLit(v), NssType::Int) => Some(ConstValue::Int(*v)),
        #[allow(clippy::cast_precision_loss)]
        (ExprKind::IntLit(v), NssType::Float) => Some(ConstValue::Float(*v as f32)),
        (ExprKind::FloatLit(v), NssType::Float) => Some(ConstValue::Float(*v)),
        (ExprKind::StringLit(s), NssType::String) => Some(ConstValue::String(s.clone())),
        (ExprKind::ObjectLit(v), NssType::Object) => Some(ConstValue::Object(*v)),
        _ => None,
    }
}

// ── Shared cache ─────────────────────────────────────────────────────

static BUILTIN: LazyLock<RwLock<HashMap<GameVariant, Arc<DeclarationTable>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Process-wide store of parsed built-in tables, one per game.
pub struct DeclarationCache;

impl DeclarationCache {
    pub fn builtin(variant: GameVariant) -> Result<Arc<DeclarationTable>, Vec<CompileError>> {
        if let Some(table) = BUILTIN.read().get(&variant) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(DeclarationTable::parse(variant.builtin_declarations())?);
        let mut cache = BUILTIN.write();
        // Another thread may have won the race; keep whichever landed first.
        Ok(Arc::clone(cache.entry(variant).or_insert(table)))
    }

    /// The override table when one is given, else the built-in one.
    pub fn resolve(
        variant: GameVariant,
        override_table: Option<&Arc<DeclarationTable>>,
    ) -> Result<Arc<DeclarationTable>, Vec<CompileError>> {
        match override_table {
            Some(table) => Ok(Arc::clone(table)),
            None => Self::builtin(variant),
        }
    }
}

/// Parse a declaration file from disk, returning the source alongside any
/// errors so they can be located.
pub fn load_file(path: &Path) -> std::io::Result<(String, Result<DeclarationTable, Vec<CompileError>>)> {
    let source = std::fs::read_to_string(path)?;
    let table = DeclarationTable::parse(&source);
    Ok((source, table))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn routines_are_positional() {
        let table = DeclarationTable::parse(
            "int A = 1;\nvoid First();\nint Second(int n, float f = 1.0);\nstring Third();",
        )
        .unwrap();
        assert_eq!(table.function("First").unwrap().routine, 0);
        assert_eq!(table.function("Third").unwrap().routine, 2);
        assert_eq!(table.by_routine(1).unwrap().name, "Second");
        assert_eq!(table.function("Second").unwrap().required_params(), 1);
        assert_eq!(table.constant("A"), Some(&ConstValue::Int(1)));
    }

    #[test]
    fn builtin_tables_parse() {
        for variant in [GameVariant::K1, GameVariant::K2] {
            let table = DeclarationCache::builtin(variant).unwrap();
            assert_eq!(table.function("Random").unwrap().routine, 0);
            assert_eq!(table.function("PrintString").unwrap().routine, 1);
            assert_eq!(table.function("DelayCommand").unwrap().routine, 7);
            assert_eq!(table.function("GetPosition").unwrap().return_type, NssType::Vector);
            assert_eq!(table.constant("TRUE"), Some(&ConstValue::Int(1)));
            assert_eq!(table.function("EffectHeal").unwrap().routine, 78);
            assert_eq!(table.function("IntToString").unwrap().routine, 92);
            assert_eq!(table.function("IntToFloat").unwrap().routine, 230);
            assert_eq!(table.function("GetFirstPC").unwrap().routine, 548);
            assert_eq!(table.function("ActionBarkString").unwrap().routine, 700);
            assert_eq!(table.by_routine(767).unwrap().name, "SetAvailableNPCId");
        }
    }

    #[test]
    fn game_tables_diverge_after_the_shared_block() {
        let k1 = DeclarationCache::builtin(GameVariant::K1).unwrap();
        let k2 = DeclarationCache::builtin(GameVariant::K2).unwrap();
        assert_eq!(k1.function_count(), 772);
        assert_eq!(k2.function_count(), 877);

        assert_eq!(k1.function("YavinHackCloseDoor").unwrap().routine, 771);
        assert!(k2.function("YavinHackCloseDoor").is_none());
        assert_eq!(k2.function("GetScriptParameter").unwrap().routine, 768);
        assert_eq!(k2.function("GetInfluence").unwrap().routine, 795);
        assert_eq!(k2.function("RebuildPartyTable").unwrap().routine, 876);
        assert!(k1.function("GetInfluence").is_none());

        // widened in the sequel, same routine number
        let k1_combat = k1.function("GetIsInCombat").unwrap();
        let k2_combat = k2.function("GetIsInCombat").unwrap();
        assert_eq!(k1_combat.routine, k2_combat.routine);
        assert_eq!(k1_combat.params.len() + 1, k2_combat.params.len());

        assert_eq!(k1.constant("NUM_INVENTORY_SLOTS"), Some(&ConstValue::Int(18)));
        assert_eq!(k2.constant("NUM_INVENTORY_SLOTS"), Some(&ConstValue::Int(20)));
        assert!(k1.constant("INVENTORY_SLOT_RIGHTWEAPON2").is_none());
        assert_eq!(k2.constant("NPC_PLAYER"), Some(&ConstValue::Int(-1)));
    }

    #[test]
    fn cache_shares_one_table() {
        let a = DeclarationCache::builtin(GameVariant::K1).unwrap();
        let b = DeclarationCache::builtin(GameVariant::K1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn override_wins() {
        let custom = Arc::new(DeclarationTable::parse("void Only();").unwrap());
        let resolved = DeclarationCache::resolve(GameVariant::K1, Some(&custom)).unwrap();
        assert_eq!(resolved.function_count(), 1);
    }

    #[test]
    fn non_literal_constant_rejected() {
        let errs = DeclarationTable::parse("int A = 1 + 2;").unwrap_err();
        assert!(errs[0].message.contains("literal"));
    }
}
