//! Cheaply-cloneable interned-ish string type used for identifiers that get cloned into
//! every span and every map key on the hot path (agent ids, bind names, endpoints).

pub type Strng = arcstr::ArcStr;

pub fn new(s: impl AsRef<str>) -> Strng {
	Strng::from(s.as_ref())
}
