//! Typed model of the operand stack during simulation.
//!
//! Every stack cell is either a variable (a reserved slot that instructions
//! address by offset) or a value (an expression fragment waiting for its
//! consumer). Variables start out one cell wide; when an instruction reads or
//! writes several adjacent cells at once they are merged into a vector or a
//! synthesized struct, and the original cells become its fields.

use std::collections::HashMap;

use crate::nss::ast::{BinOp, UnaryOp};
use crate::nss::typeck::{FieldLayout, StructTable};
use crate::nss::NssType;

pub type VarId = usize;

// ── Recovered tree ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum DExpr {
    Int(i32),
    Float(f32),
    Str(String),
    Object(i32),
    Var(VarId),
    Field(Box<DExpr>, String),
    Vector(Box<DExpr>, Box<DExpr>, Box<DExpr>),
    Binary {
        op: BinOp,
        left: Box<DExpr>,
        right: Box<DExpr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<DExpr>,
    },
    IncDec {
        target: Box<DExpr>,
        increment: bool,
        prefix: bool,
    },
    Assign {
        target: Box<DExpr>,
        value: Box<DExpr>,
    },
    Ternary {
        cond: Box<DExpr>,
        then_expr: Box<DExpr>,
        else_expr: Box<DExpr>,
    },
    /// Index into the subroutine table.
    CallUser {
        sub: usize,
        args: Vec<DExpr>,
    },
    CallEngine {
        name: String,
        args: Vec<DExpr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DStmt {
    Decl {
        var: VarId,
        init: Option<DExpr>,
    },
    Expr(DExpr),
    If {
        cond: DExpr,
        then_branch: Vec<DStmt>,
        else_branch: Option<Vec<DStmt>>,
    },
    While {
        cond: DExpr,
        body: Vec<DStmt>,
    },
    DoWhile {
        body: Vec<DStmt>,
        cond: DExpr,
    },
    For {
        init: Option<DExpr>,
        cond: Option<DExpr>,
        step: Option<DExpr>,
        body: Vec<DStmt>,
    },
    Switch {
        scrutinee: DExpr,
        cases: Vec<DCase>,
    },
    Return(Option<DExpr>),
    Break,
    Continue,
}

/// `value` is `None` for `default:`.
#[derive(Debug, Clone, PartialEq)]
pub struct DCase {
    pub value: Option<i32>,
    pub body: Vec<DStmt>,
}

// ── Variables ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Local,
    Param,
    Global,
    /// The caller-reserved result slot below the parameters.
    Return,
}

#[derive(Debug, Clone)]
pub struct Var {
    pub kind: VarKind,
    pub ty: NssType,
    pub declared: bool,
    /// Aggregate this variable became a field of, and its byte offset there.
    pub parent: Option<(VarId, u32)>,
}

#[derive(Debug, Clone, Default)]
pub struct Vars {
    vars: Vec<Var>,
}

impl Vars {
    pub fn add(&mut self, kind: VarKind, ty: NssType) -> VarId {
        let declared = matches!(kind, VarKind::Param | VarKind::Return);
        self.vars.push(Var {
            kind,
            ty,
            declared,
            parent: None,
        });
        self.vars.len() - 1
    }

    pub fn get(&self, id: VarId) -> &Var {
        &self.vars[id]
    }

    /// Outermost aggregate containing `id` and the byte offset within it.
    pub fn root(&self, id: VarId) -> (VarId, u32) {
        let mut cur = id;
        let mut offset = 0;
        while let Some((parent, off)) = self.vars.get(cur).and_then(|v| v.parent) {
            cur = parent;
            offset += off;
        }
        (cur, offset)
    }

    pub fn is_declared(&self, id: VarId) -> bool {
        let (root, _) = self.root(id);
        self.vars[root].declared
    }

    pub fn mark_declared(&mut self, id: VarId) {
        let (root, _) = self.root(id);
        self.vars[root].declared = true;
    }

    fn adopt(&mut self, child: VarId, parent: VarId, offset: u32) {
        self.vars[child].parent = Some((parent, offset));
    }
}

// ── Types ────────────────────────────────────────────────────────────

/// Struct layouts invented for merged cells, keyed by their field types.
#[derive(Debug, Clone, Default)]
pub struct Types {
    pub structs: StructTable,
    by_fields: HashMap<Vec<NssType>, String>,
}

impl Types {
    pub fn size_of(&self, ty: &NssType) -> u32 {
        self.structs.size_of(ty)
    }

    /// Type of an aggregate whose members have these types, in stack order.
    pub fn aggregate(&mut self, members: &[NssType]) -> NssType {
        if members == [NssType::Float, NssType::Float, NssType::Float] {
            return NssType::Vector;
        }
        if let Some(name) = self.by_fields.get(members) {
            return NssType::Struct(name.clone());
        }
        let name = format!("structure{}", self.by_fields.len() + 1);
        let mut offset = 0;
        let fields = members
            .iter()
            .enumerate()
            .map(|(n, ty)| {
                let field = FieldLayout {
                    name: format!("{}Field{}", ty.name_prefix(), n + 1),
                    ty: ty.clone(),
                    offset,
                };
                offset += self.size_of(ty);
                field
            })
            .collect();
        self.structs.insert(name.clone(), fields);
        self.by_fields.insert(members.to_vec(), name.clone());
        NssType::Struct(name)
    }

    /// Field names leading to the `size` bytes at `offset` inside `ty`.
    pub fn field_path(&self, ty: &NssType, offset: u32, size: u32) -> Option<(Vec<String>, NssType)> {
        if offset == 0 && size == self.size_of(ty) {
            return Some((Vec::new(), ty.clone()));
        }
        match ty {
            NssType::Vector if size == 4 && offset < 12 && offset % 4 == 0 => {
                let name = ["x", "y", "z"][(offset / 4) as usize];
                Some((vec![name.to_string()], NssType::Float))
            }
            NssType::Struct(name) => {
                let fields = self.structs.get(name)?;
                let field = fields
                    .iter()
                    .find(|f| f.offset <= offset && offset + size <= f.offset + self.size_of(&f.ty))?;
                let (mut rest, inner) = self.field_path(&field.ty, offset - field.offset, size)?;
                rest.insert(0, field.name.clone());
                Some((rest, inner))
            }
            _ => None,
        }
    }
}

pub fn field_expr(base: DExpr, path: Vec<String>) -> DExpr {
    path.into_iter()
        .fold(base, |acc, name| DExpr::Field(Box::new(acc), name))
}

// ── Frame ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Var(VarId),
    Value(DExpr, NssType),
    /// Occupies stack space but never surfaces as a statement: a switch
    /// scrutinee, or a value already copied into the return slot.
    Hidden,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub size: i32,
    pub item: Item,
}

/// The simulated stack of one subroutine. Positions are byte offsets from
/// the stack pointer at subroutine entry.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub base: i32,
    pub slots: Vec<Slot>,
}

impl Frame {
    pub fn new(base: i32) -> Self {
        Self {
            base,
            slots: Vec::new(),
        }
    }

    pub fn top(&self) -> i32 {
        self.base + self.slots.iter().map(|s| s.size).sum::<i32>()
    }

    pub fn push(&mut self, size: i32, item: Item) {
        self.slots.push(Slot { size, item });
    }

    pub fn top_var(&self) -> Option<VarId> {
        match self.slots.last()?.item {
            Item::Var(v) => Some(v),
            _ => None,
        }
    }

    /// Collapse runs of member slots back into the aggregate they were
    /// merged into, after a frame snapshot from before the merge is restored.
    pub fn normalize(&mut self, vars: &Vars, types: &Types) {
        let mut out = Vec::with_capacity(self.slots.len());
        let mut k = 0;
        while k < self.slots.len() {
            if let Item::Var(v) = self.slots[k].item {
                let (root, offset) = vars.root(v);
                if root != v && offset == 0 {
                    let size = i32::try_from(types.size_of(&vars.get(root).ty)).unwrap_or(0);
                    let mut covered = 0;
                    let mut m = k;
                    while m < self.slots.len() && covered < size {
                        covered += self.slots[m].size;
                        m += 1;
                    }
                    if covered == size {
                        out.push(Slot {
                            size,
                            item: Item::Var(root),
                        });
                        k = m;
                        continue;
                    }
                }
            }
            out.push(self.slots[k].clone());
            k += 1;
        }
        self.slots = out;
    }

    /// Slot index covering `pos` and that slot's starting position.
    fn locate(&self, pos: i32) -> Option<(usize, i32)> {
        let mut start = self.base;
        for (n, slot) in self.slots.iter().enumerate() {
            if pos >= start && pos < start + slot.size {
                return Some((n, start));
            }
            start += slot.size;
        }
        None
    }

    /// Lvalue for the `size` bytes at `pos`. Adjacent variables addressed
    /// together are merged into one aggregate first.
    pub fn place(&mut self, pos: i32, size: i32, vars: &mut Vars, types: &mut Types) -> Result<(DExpr, NssType), String> {
        let (first, start) = self
            .locate(pos)
            .ok_or_else(|| format!("stack position {pos} is outside the frame"))?;
        let slot = &self.slots[first];
        let Item::Var(var) = slot.item else {
            return Err(format!("stack position {pos} holds a temporary, not a variable"));
        };

        if pos + size <= start + slot.size {
            let ty = vars.get(var).ty.clone();
            let offset = u32::try_from(pos - start).unwrap_or(0);
            let size = u32::try_from(size).unwrap_or(0);
            let (path, field_ty) = types
                .field_path(&ty, offset, size)
                .ok_or_else(|| format!("no field of {ty} at offset {offset} spans {size} bytes"))?;
            return Ok((field_expr(DExpr::Var(var), path), field_ty));
        }
        if pos != start {
            return Err(format!("access at {pos} starts inside a variable and leaves it"));
        }

        let mut last = first;
        let mut covered = 0;
        while covered < size {
            let slot = self
                .slots
                .get(last)
                .ok_or_else(|| format!("access at {pos} runs past the stack top"))?;
            if !matches!(slot.item, Item::Var(_)) {
                return Err(format!("access at {pos} spans a temporary"));
            }
            covered += slot.size;
            last += 1;
        }
        if covered != size {
            return Err(format!("access at {pos} ends inside a variable"));
        }

        let members: Vec<VarId> = self.slots[first..last]
            .iter()
            .filter_map(|s| match s.item {
                Item::Var(v) => Some(v),
                _ => None,
            })
            .collect();
        let member_types: Vec<NssType> = members.iter().map(|&m| vars.get(m).ty.clone()).collect();
        let ty = types.aggregate(&member_types);
        let kind = vars.get(members[0]).kind;
        let declared = members.iter().any(|&m| vars.is_declared(m));
        let group = vars.add(kind, ty.clone());
        if declared {
            vars.mark_declared(group);
        }
        let mut offset = 0;
        for &m in &members {
            vars.adopt(m, group, offset);
            offset += types.size_of(&vars.get(m).ty);
        }
        self.slots.splice(first..last, [Slot { size, item: Item::Var(group) }]);
        log::trace!("merged {} cells at {pos} into {ty}", members.len());
        Ok((DExpr::Var(group), ty))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn frame_of(vars: &mut Vars, types: &[NssType]) -> Frame {
        let mut frame = Frame::new(0);
        for ty in types {
            let v = vars.add(VarKind::Local, ty.clone());
            frame.push(4, Item::Var(v));
        }
        frame
    }

    #[test]
    fn single_cell_is_the_variable() {
        let mut vars = Vars::default();
        let mut types = Types::default();
        let mut frame = frame_of(&mut vars, &[NssType::Int, NssType::String]);
        let (e, ty) = frame.place(4, 4, &mut vars, &mut types).unwrap();
        assert_eq!(e, DExpr::Var(1));
        assert_eq!(ty, NssType::String);
    }

    #[test]
    fn three_floats_merge_into_a_vector() {
        let mut vars = Vars::default();
        let mut types = Types::default();
        let mut frame = frame_of(&mut vars, &[NssType::Float, NssType::Float, NssType::Float]);
        let (e, ty) = frame.place(0, 12, &mut vars, &mut types).unwrap();
        assert_eq!(ty, NssType::Vector);
        let DExpr::Var(group) = e else { panic!("expected a variable") };
        assert_eq!(frame.slots.len(), 1);
        assert_eq!(vars.root(1), (group, 4));

        let (field, fty) = frame.place(8, 4, &mut vars, &mut types).unwrap();
        assert_eq!(field, DExpr::Field(Box::new(DExpr::Var(group)), "z".into()));
        assert_eq!(fty, NssType::Float);
    }

    #[test]
    fn mixed_cells_become_a_struct() {
        let mut vars = Vars::default();
        let mut types = Types::default();
        let mut frame = frame_of(&mut vars, &[NssType::Int, NssType::Object]);
        let (_, ty) = frame.place(0, 8, &mut vars, &mut types).unwrap();
        assert_eq!(ty, NssType::Struct("structure1".into()));
        let fields = types.structs.get("structure1").unwrap();
        assert_eq!(fields[1].name, "oField2");
        assert_eq!(fields[1].offset, 4);
        // Same member types reuse the layout.
        assert_eq!(types.aggregate(&[NssType::Int, NssType::Object]), ty);
    }

    #[test]
    fn straddling_access_is_rejected() {
        let mut vars = Vars::default();
        let mut types = Types::default();
        let mut frame = frame_of(&mut vars, &[NssType::Int, NssType::Int]);
        frame.push(4, Item::Value(DExpr::Int(1), NssType::Int));
        assert!(frame.place(4, 8, &mut vars, &mut types).is_err());
        assert!(frame.place(20, 4, &mut vars, &mut types).is_err());
    }

    #[test]
    fn declared_members_declare_the_aggregate() {
        let mut vars = Vars::default();
        let mut types = Types::default();
        let mut frame = frame_of(&mut vars, &[NssType::Float, NssType::Float, NssType::Float]);
        vars.mark_declared(0);
        let (e, _) = frame.place(0, 12, &mut vars, &mut types).unwrap();
        let DExpr::Var(group) = e else { panic!("expected a variable") };
        assert!(vars.is_declared(group));
        assert!(vars.is_declared(2));
    }

    #[test]
    fn restored_snapshot_picks_up_later_merges() {
        let mut vars = Vars::default();
        let mut types = Types::default();
        let mut frame = frame_of(&mut vars, &[NssType::Int, NssType::Float, NssType::Float, NssType::Float]);
        let snapshot = frame.slots.clone();
        let (e, _) = frame.place(4, 12, &mut vars, &mut types).unwrap();
        frame.slots = snapshot;
        frame.normalize(&vars, &types);
        assert_eq!(frame.slots.len(), 2);
        assert_eq!(frame.slots[1].item, Item::Var(match e {
            DExpr::Var(g) => g,
            _ => panic!("expected a variable"),
        }));
        assert_eq!(frame.top(), 16);
    }
}
