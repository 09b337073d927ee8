//! Voxel rasterization and the NRRD writer.
//!
//! The grid is fixed per template: dimensions from [`TemplateSpace::grid_dims`],
//! origin at the extent minimum, spacing equal to the pitch. Every node lights
//! its own voxel plus the 3×3×3 block around it so thin branches stay visible
//! after downsampling. Nodes outside the template are dropped and counted.

use crate::types::{Point, TemplateSpace};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::{self, Write};

/// Value written into marked voxels.
pub const MARK: u8 = 255;

/// Half-width of the neighbourhood each node marks.
const NEIGHBOURHOOD: i64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct VoxelGrid {
    pub dims: [usize; 3],
    pub origin: Point,
    pub pitch: Point,
    /// x varies fastest, then y, then z.
    pub data: Vec<u8>,
}

impl VoxelGrid {
    pub fn empty(template: &TemplateSpace) -> Self {
        let dims = template.grid_dims();
        Self {
            dims,
            origin: template.extent.min,
            pitch: template.pitch,
            data: vec![0; dims[0] * dims[1] * dims[2]],
        }
    }

    fn index(&self, v: [usize; 3]) -> usize {
        v[0] + self.dims[0] * (v[1] + self.dims[1] * v[2])
    }

    pub fn get(&self, v: [usize; 3]) -> u8 {
        self.data[self.index(v)]
    }

    pub fn marked(&self) -> usize {
        self.data.iter().filter(|v| **v != 0).count()
    }

    /// Voxel containing `p`, if inside the grid.
    pub fn voxel_of(&self, p: Point) -> Option<[usize; 3]> {
        let mut v = [0usize; 3];
        for axis in 0..3 {
            let i = ((p[axis] - self.origin[axis]) / self.pitch[axis]).floor();
            if !i.is_finite() || i < 0.0 || i >= self.dims[axis] as f64 {
                return None;
            }
            v[axis] = i as usize;
        }
        Some(v)
    }

    /// Mark `p`'s voxel and its neighbourhood. Returns false if `p` lies
    /// outside the grid.
    pub fn mark(&mut self, p: Point) -> bool {
        let Some(center) = self.voxel_of(p) else {
            return false;
        };
        for dz in -NEIGHBOURHOOD..=NEIGHBOURHOOD {
            for dy in -NEIGHBOURHOOD..=NEIGHBOURHOOD {
                for dx in -NEIGHBOURHOOD..=NEIGHBOURHOOD {
                    let x = center[0] as i64 + dx;
                    let y = center[1] as i64 + dy;
                    let z = center[2] as i64 + dz;
                    if x < 0
                        || y < 0
                        || z < 0
                        || x >= self.dims[0] as i64
                        || y >= self.dims[1] as i64
                        || z >= self.dims[2] as i64
                    {
                        continue;
                    }
                    let idx = self.index([x as usize, y as usize, z as usize]);
                    self.data[idx] = MARK;
                }
            }
        }
        true
    }
}

/// Rasterize positions (already in template units). Returns the grid and the
/// number of points that fell outside it.
pub fn rasterize(template: &TemplateSpace, positions: &[Point]) -> (VoxelGrid, usize) {
    let mut grid = VoxelGrid::empty(template);
    let outside = positions.iter().filter(|p| !grid.mark(**p)).count();
    (grid, outside)
}

/// Write a gzip-encoded NRRD with physical spacing, origin and units.
pub fn write_nrrd(out: &mut impl Write, grid: &VoxelGrid, units: &str) -> io::Result<()> {
    let [sx, sy, sz] = grid.dims;
    let [px, py, pz] = grid.pitch;
    let [ox, oy, oz] = grid.origin;
    write!(
        out,
        "NRRD0004\n\
         # Complete NRRD file format specification at:\n\
         # http://teem.sourceforge.net/nrrd/format.html\n\
         type: uint8\n\
         dimension: 3\n\
         space: left-posterior-superior\n\
         sizes: {sx} {sy} {sz}\n\
         space directions: ({px},0,0) (0,{py},0) (0,0,{pz})\n\
         kinds: domain domain domain\n\
         labels: \"x\" \"y\" \"z\"\n\
         space units: \"{units}\" \"{units}\" \"{units}\"\n\
         endian: little\n\
         encoding: gzip\n\
         space origin: ({ox},{oy},{oz})\n\
         \n"
    )?;
    let mut encoder = GzEncoder::new(out, Compression::best());
    encoder.write_all(&grid.data)?;
    encoder.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Extent, Region};
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn template() -> TemplateSpace {
        TemplateSpace {
            id: "T".into(),
            name: "T".into(),
            aliases: vec![],
            region: Region::Primary,
            extent: Extent {
                min: [0.0, 0.0, 0.0],
                max: [10.0, 8.0, 6.0],
            },
            pitch: [1.0, 1.0, 2.0],
            node_scale: 1.0,
            units: "microns".into(),
        }
    }

    #[test]
    fn grid_comes_from_template_not_item() {
        let (grid, _) = rasterize(&template(), &[[5.0, 5.0, 3.0]]);
        assert_eq!(grid.dims, [10, 8, 3]);
        assert_eq!(grid.data.len(), 240);
    }

    #[test]
    fn node_marks_its_neighbourhood() {
        let (grid, outside) = rasterize(&template(), &[[5.5, 4.5, 2.5]]);
        assert_eq!(outside, 0);
        assert_eq!(grid.marked(), 27);
        assert_eq!(grid.get([5, 4, 1]), MARK);
        assert_eq!(grid.get([4, 3, 0]), MARK);
        assert_eq!(grid.get([6, 5, 2]), MARK);
        assert_eq!(grid.get([7, 4, 1]), 0);
    }

    #[test]
    fn neighbourhood_is_clipped_at_edges() {
        let (grid, _) = rasterize(&template(), &[[0.1, 0.1, 0.1]]);
        assert_eq!(grid.marked(), 8);
    }

    #[test]
    fn outside_points_are_counted_not_marked() {
        let (grid, outside) = rasterize(&template(), &[[-1.0, 0.0, 0.0], [100.0, 1.0, 1.0], [f64::NAN, 0.0, 0.0]]);
        assert_eq!(outside, 3);
        assert_eq!(grid.marked(), 0);
    }

    #[test]
    fn nrrd_header_and_gzip_payload() {
        let (grid, _) = rasterize(&template(), &[[5.5, 4.5, 2.5]]);
        let mut buf = Vec::new();
        write_nrrd(&mut buf, &grid, "microns").unwrap();

        let split = buf.windows(2).position(|w| w == b"\n\n").unwrap();
        let header = std::str::from_utf8(&buf[..split]).unwrap();
        assert!(header.starts_with("NRRD0004\n"));
        assert!(header.contains("sizes: 10 8 3"));
        assert!(header.contains("space directions: (1,0,0) (0,1,0) (0,0,2)"));
        assert!(header.contains("encoding: gzip"));
        assert!(header.contains("space origin: (0,0,0)"));
        assert!(header.contains("space units: \"microns\" \"microns\" \"microns\""));

        let mut data = Vec::new();
        GzDecoder::new(&buf[split + 2..]).read_to_end(&mut data).unwrap();
        assert_eq!(data, grid.data);
    }
}
