use std::fmt;

use crate::ncs::Qualifier;

/// The fixed NWScript type set plus named structs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NssType {
    Void,
    Int,
    Float,
    String,
    Object,
    Vector,
    Effect,
    Event,
    Location,
    Talent,
    /// Only valid as a parameter type of engine functions.
    Action,
    Struct(String),
}

impl NssType {
    pub fn from_keyword(word: &str) -> Option<Self> {
        Some(match word {
            "void" => Self::Void,
            "int" => Self::Int,
            "float" => Self::Float,
            "string" => Self::String,
            "object" => Self::Object,
            "vector" => Self::Vector,
            "effect" => Self::Effect,
            "event" => Self::Event,
            "location" => Self::Location,
            "talent" => Self::Talent,
            "action" => Self::Action,
            _ => return None,
        })
    }

    /// Cell qualifier for single-cell types (`RSADD`, `CONST`, unary ops).
    pub fn qualifier(&self) -> Option<Qualifier> {
        Some(match self {
            Self::Int => Qualifier::Int,
            Self::Float => Qualifier::Float,
            Self::String => Qualifier::String,
            Self::Object => Qualifier::Object,
            Self::Effect => Qualifier::Effect,
            Self::Event => Qualifier::Event,
            Self::Location => Qualifier::Location,
            Self::Talent => Qualifier::Talent,
            _ => return None,
        })
    }

    pub fn from_qualifier(q: Qualifier) -> Option<Self> {
        Some(match q {
            Qualifier::Int => Self::Int,
            Qualifier::Float => Self::Float,
            Qualifier::String => Self::String,
            Qualifier::Object => Self::Object,
            Qualifier::Effect => Self::Effect,
            Qualifier::Event => Self::Event,
            Qualifier::Location => Self::Location,
            Qualifier::Talent => Self::Talent,
            _ => return None,
        })
    }

    /// Qualifier of `EQUAL`/`NEQUAL` between two values of this type.
    pub fn pair_qualifier(&self) -> Qualifier {
        match self {
            Self::Int => Qualifier::IntInt,
            Self::Float => Qualifier::FloatFloat,
            Self::String => Qualifier::StringString,
            Self::Object => Qualifier::ObjectObject,
            Self::Effect => Qualifier::EffectEffect,
            Self::Event => Qualifier::EventEvent,
            Self::Location => Qualifier::LocationLocation,
            Self::Talent => Qualifier::TalentTalent,
            _ => Qualifier::StructStruct,
        }
    }

    pub fn is_engine(&self) -> bool {
        matches!(self, Self::Effect | Self::Event | Self::Location | Self::Talent)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Identifier prefix used for synthesized names.
    pub fn name_prefix(&self) -> &'static str {
        match self {
            Self::Int => "n",
            Self::Float => "f",
            Self::String => "s",
            Self::Object => "o",
            Self::Vector => "v",
            Self::Effect => "e",
            Self::Event => "ev",
            Self::Location => "l",
            Self::Talent => "t",
            Self::Struct(_) => "st",
            Self::Void | Self::Action => "x",
        }
    }
}

impl fmt::Display for NssType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::String => f.write_str("string"),
            Self::Object => f.write_str("object"),
            Self::Vector => f.write_str("vector"),
            Self::Effect => f.write_str("effect"),
            Self::Event => f.write_str("event"),
            Self::Location => f.write_str("location"),
            Self::Talent => f.write_str("talent"),
            Self::Action => f.write_str("action"),
            Self::Struct(name) => write!(f, "struct {name}"),
        }
    }
}
