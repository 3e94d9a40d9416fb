//! Purpose: Fixed molecule recipes and producibility math over counter snapshots.
//! Exports: `Molecule`, `Product`, `DeliverOutcome`, `deliver`.
//! Role: Pure stoichiometry layer; all storage effects go through `InventoryStore`.
//! Invariants: Recipes are immutable; feasibility math never overflows or panics.
//! Invariants: A delivery debits all required atoms or none of them.

use std::fmt;

use crate::core::error::Error;
use crate::core::store::{Atom, Inventory, InventoryStore, StoreOutcome};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Molecule {
    Water,
    CarbonDioxide,
    Alcohol,
    Glucose,
}

impl Molecule {
    /// Atoms consumed per unit.
    pub const fn recipe(self) -> Inventory {
        match self {
            Self::Water => Inventory {
                carbon: 0,
                oxygen: 1,
                hydrogen: 2,
            },
            Self::CarbonDioxide => Inventory {
                carbon: 1,
                oxygen: 2,
                hydrogen: 0,
            },
            Self::Alcohol => Inventory {
                carbon: 2,
                oxygen: 1,
                hydrogen: 6,
            },
            Self::Glucose => Inventory {
                carbon: 6,
                oxygen: 6,
                hydrogen: 12,
            },
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "WATER" => Some(Self::Water),
            "CARBON DIOXIDE" => Some(Self::CarbonDioxide),
            "ALCOHOL" => Some(Self::Alcohol),
            "GLUCOSE" => Some(Self::Glucose),
            _ => None,
        }
    }

    /// Units producible from `stock` without mutating anything. Atom kinds
    /// the recipe does not use never constrain the result.
    pub fn max_producible(self, stock: Inventory) -> u64 {
        let need = self.recipe();
        let mut best = u64::MAX;
        for atom in [Atom::Carbon, Atom::Oxygen, Atom::Hydrogen] {
            let per_unit = need.get(atom);
            if per_unit == 0 {
                continue;
            }
            best = best.min(stock.get(atom) / per_unit);
        }
        // Every recipe consumes at least one atom kind, so best is finite.
        best
    }

    /// Total requirement for `quantity` units. Saturation only means the
    /// requirement is beyond any stock a store can legally hold.
    pub fn requirement(self, quantity: u64) -> Inventory {
        let need = self.recipe();
        Inventory {
            carbon: need.carbon.saturating_mul(quantity),
            oxygen: need.oxygen.saturating_mul(quantity),
            hydrogen: need.hydrogen.saturating_mul(quantity),
        }
    }
}

impl fmt::Display for Molecule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Water => "WATER",
            Self::CarbonDioxide => "CARBON DIOXIDE",
            Self::Alcohol => "ALCOHOL",
            Self::Glucose => "GLUCOSE",
        };
        f.write_str(name)
    }
}

/// Console-queryable composites; one unit of each molecule per serving.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Product {
    SoftDrink,
    Vodka,
    Champagne,
}

impl Product {
    pub const fn molecules(self) -> [Molecule; 3] {
        match self {
            Self::SoftDrink => [Molecule::Water, Molecule::CarbonDioxide, Molecule::Alcohol],
            Self::Vodka => [Molecule::Water, Molecule::Alcohol, Molecule::Glucose],
            Self::Champagne => [Molecule::Water, Molecule::CarbonDioxide, Molecule::Glucose],
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "SOFT DRINK" => Some(Self::SoftDrink),
            "VODKA" => Some(Self::Vodka),
            "CHAMPAGNE" => Some(Self::Champagne),
            _ => None,
        }
    }

    /// Servings producible from one snapshot; each molecule is priced
    /// independently against the same counters.
    pub fn max_producible(self, stock: Inventory) -> u64 {
        self.molecules()
            .into_iter()
            .map(|molecule| molecule.max_producible(stock))
            .min()
            .unwrap_or(0)
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SoftDrink => "SOFT DRINK",
            Self::Vodka => "VODKA",
            Self::Champagne => "CHAMPAGNE",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliverOutcome {
    /// Debit applied; carries the counters left after the withdrawal.
    Delivered(Inventory),
    InsufficientStock,
}

/// Withdraws the atoms for `quantity` units of `molecule` in one indivisible
/// step. `quantity` must already be validated to `1..=CEILING`.
pub fn deliver(
    store: &dyn InventoryStore,
    molecule: Molecule,
    quantity: u64,
) -> Result<DeliverOutcome, Error> {
    match store.try_debit(molecule.requirement(quantity))? {
        StoreOutcome::Applied(counters) => Ok(DeliverOutcome::Delivered(counters)),
        StoreOutcome::Rejected => Ok(DeliverOutcome::InsufficientStock),
    }
}
